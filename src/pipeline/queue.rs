//! MPMC frame queue between the capture thread and the workers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::Frame;
use crate::pipeline::state::RunState;

/// What a bounded queue does with a frame that does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room, giving up only when the pipeline stops
    #[default]
    Block,
    /// Evict the oldest queued frame
    DropOldest,
    /// Discard the incoming frame
    DropNewest,
}

/// FIFO of frames awaiting processing.
///
/// Unbounded by default: `push` never blocks and a slow analyzer grows
/// memory without limit. A capacity plus [`OverflowPolicy`] caps it.
/// Each frame is handed to exactly one `pop` caller.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    overflow: OverflowPolicy,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

impl FrameQueue {
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self::from_channel(tx, rx, OverflowPolicy::Block)
    }

    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self::from_channel(tx, rx, overflow)
    }

    pub fn with_capacity(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity, overflow),
            None => Self::unbounded(),
        }
    }

    fn from_channel(tx: Sender<Frame>, rx: Receiver<Frame>, overflow: OverflowPolicy) -> Self {
        Self {
            tx,
            rx,
            overflow,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Producer: enqueue a frame. Returns false if the frame was dropped.
    ///
    /// Only a bounded queue can drop or wait; `state` lets a blocked
    /// producer notice shutdown.
    pub fn push(&self, frame: Frame, state: &RunState) -> bool {
        let accepted = match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(frame)) => self.push_full(frame, state),
        };

        if accepted {
            self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vigil_frames_dropped_total").increment(1);
        }
        metrics::gauge!("vigil_queue_depth").set(self.len() as f64);
        accepted
    }

    fn push_full(&self, mut frame: Frame, state: &RunState) -> bool {
        match self.overflow {
            OverflowPolicy::DropNewest => {
                trace!(frame = frame.sequence(), "Queue full, dropping newest");
                false
            }
            OverflowPolicy::DropOldest => loop {
                if let Ok(oldest) = self.rx.try_recv() {
                    trace!(frame = oldest.sequence(), "Queue full, dropping oldest");
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("vigil_frames_dropped_total").increment(1);
                }
                match self.tx.try_send(frame) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(back)) => frame = back,
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            },
            OverflowPolicy::Block => loop {
                match self.tx.send_timeout(frame, Duration::from_millis(50)) {
                    Ok(()) => return true,
                    Err(SendTimeoutError::Timeout(back)) if state.is_running() => frame = back,
                    Err(_) => return false,
                }
            },
        }
    }

    /// Consumer: wait up to `timeout` for a frame
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::HashSet;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::from_rgb_image(RgbImage::new(1, 1), seq)
    }

    #[test]
    fn unbounded_queue_is_fifo() {
        let state = RunState::new();
        let queue = FrameQueue::unbounded();
        for seq in 1..=100 {
            assert!(queue.push(frame(seq), &state));
        }
        assert_eq!(queue.len(), 100);
        let order: Vec<u64> = (0..100)
            .map(|_| queue.pop(Duration::from_millis(10)).unwrap().sequence())
            .collect();
        assert_eq!(order, (1..=100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = FrameQueue::unbounded();
        assert!(queue.pop(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn drop_newest_keeps_the_head() {
        let state = RunState::new();
        let queue = FrameQueue::bounded(2, OverflowPolicy::DropNewest);
        assert!(queue.push(frame(1), &state));
        assert!(queue.push(frame(2), &state));
        assert!(!queue.push(frame(3), &state));
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence(), 1);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence(), 2);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn drop_oldest_evicts_the_head() {
        let state = RunState::new();
        let queue = FrameQueue::bounded(2, OverflowPolicy::DropOldest);
        for seq in 1..=3 {
            assert!(queue.push(frame(seq), &state));
        }
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence(), 2);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence(), 3);
        assert_eq!(
            queue.stats(),
            QueueStats {
                pushed: 3,
                popped: 2,
                dropped: 1
            }
        );
    }

    #[test]
    fn blocked_push_gives_up_after_stop() {
        let state = RunState::new();
        let queue = FrameQueue::bounded(1, OverflowPolicy::Block);
        assert!(queue.push(frame(1), &state));

        let producer = {
            let queue = queue.clone();
            let state = state.clone();
            thread::spawn(move || queue.push(frame(2), &state))
        };
        thread::sleep(Duration::from_millis(100));
        state.stop(crate::pipeline::StopReason::Requested);
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn concurrent_consumers_see_each_frame_once() {
        let state = RunState::new();
        let queue = FrameQueue::unbounded();
        for seq in 1..=500 {
            queue.push(frame(seq), &state);
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(frame) = queue.pop(Duration::from_millis(20)) {
                        seen.push(frame.sequence());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        assert_eq!(all.len(), 500);
        let unique: HashSet<u64> = all.into_iter().collect();
        assert_eq!(unique.len(), 500);
    }
}
