//! Run state shared by the capture thread, the workers and the caller

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::capture::frame::StreamDescriptor;

/// Why the pipeline stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// A finite source delivered all of its frames
    SourceExhausted,
    /// The retry budget ran out while connecting
    ConnectionFailed,
    /// The frame sink could not be initialized
    SinkFailed,
}

/// `running` flag plus counters, readable from any thread.
///
/// `running` only ever goes from true to false. The first transition
/// records its [`StopReason`]; later ones are ignored.
#[derive(Debug)]
pub struct RunState {
    running: AtomicBool,
    /// True while the capture thread may still push frames
    capturing: AtomicBool,
    frame_count: AtomicU64,
    reason: OnceCell<StopReason>,
    descriptor: ArcSwapOption<StreamDescriptor>,
    /// Wakes sleepers when `running` flips
    gate: Mutex<()>,
    wake: Condvar,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            capturing: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            reason: OnceCell::new(),
            descriptor: ArcSwapOption::empty(),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip `running` to false. Returns true for the call that did it.
    pub fn stop(&self, reason: StopReason) -> bool {
        let _ = self.reason.set(reason);
        let flipped = self.running.swap(false, Ordering::SeqCst);
        if flipped {
            debug!(?reason, "Run state set to stopped");
        }
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
        flipped
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::SeqCst);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Count one more captured frame, returning the new total
    pub fn record_frame(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn descriptor(&self) -> Option<StreamDescriptor> {
        self.descriptor.load_full().map(|d| *d)
    }

    pub fn publish_descriptor(&self, descriptor: StreamDescriptor) {
        self.descriptor.store(Some(Arc::new(descriptor)));
    }

    /// Sleep for `duration`, returning early if the pipeline stops.
    /// Returns whether the pipeline is still running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.is_running()
    }

    /// Block until the pipeline stops or `timeout` elapses.
    /// Returns true if it stopped.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        !self.sleep(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_stop_reason_wins() {
        let state = RunState::new();
        assert!(state.is_running());
        assert!(state.stop(StopReason::SourceExhausted));
        assert!(!state.stop(StopReason::Requested));
        assert!(!state.is_running());
        assert_eq!(state.stop_reason(), Some(StopReason::SourceExhausted));
    }

    #[test]
    fn frame_count_is_monotonic() {
        let state = RunState::new();
        assert_eq!(state.record_frame(), 1);
        assert_eq!(state.record_frame(), 2);
        assert_eq!(state.frame_count(), 2);
    }

    #[test]
    fn stop_wakes_sleepers() {
        let state = RunState::new();
        let sleeper = {
            let state = state.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let running = state.sleep(Duration::from_secs(30));
                (running, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        state.stop(StopReason::Requested);

        let (running, elapsed) = sleeper.join().unwrap();
        assert!(!running);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn sleep_runs_to_deadline_while_running() {
        let state = RunState::new();
        let started = Instant::now();
        assert!(state.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!state.wait_for_stop(Duration::from_millis(1)));
    }

    #[test]
    fn descriptor_is_published() {
        let state = RunState::new();
        assert_eq!(state.descriptor(), None);
        let descriptor = StreamDescriptor {
            width: 640,
            height: 480,
            fps: 30.0,
            total_frames: None,
        };
        state.publish_descriptor(descriptor);
        assert_eq!(state.descriptor(), Some(descriptor));
    }
}
