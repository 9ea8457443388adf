//! Frame processor worker: queue -> analyzer -> sink

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::analysis::FrameAnalyzer;
use crate::capture::Frame;
use crate::error::AnalysisError;
use crate::output::Recording;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::state::RunState;
use crate::AnalysisFailurePolicy;

/// One of N identical consumers of the frame queue.
///
/// Workers keep draining after `running` goes false and exit once the
/// capture thread is gone and the queue is empty. The last worker to exit
/// finalizes the recording.
pub struct FrameProcessor {
    pub(crate) id: usize,
    pub(crate) state: Arc<RunState>,
    pub(crate) queue: FrameQueue,
    pub(crate) analyzer: Arc<dyn FrameAnalyzer>,
    pub(crate) recording: Option<Arc<Recording>>,
    pub(crate) poll_timeout: Duration,
    pub(crate) on_failure: AnalysisFailurePolicy,
    /// Workers that have not exited yet
    pub(crate) active: Arc<AtomicUsize>,
}

/// Decrements the live-worker count even if the worker unwinds
struct ExitGuard<'a> {
    worker: &'a FrameProcessor,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if self.worker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(recording) = &self.worker.recording {
                recording.release();
            }
        }
    }
}

impl FrameProcessor {
    pub fn run(self) {
        let _guard = ExitGuard { worker: &self };
        debug!(worker = self.id, "Frame processor started");

        while self.state.is_running() || self.state.is_capturing() || !self.queue.is_empty() {
            if let Some(frame) = self.queue.pop(self.poll_timeout) {
                self.process(frame);
            }
        }

        info!(worker = self.id, "Frame processor finished");
    }

    fn process(&self, frame: Frame) {
        let sequence = frame.sequence();
        let raw = match self.on_failure {
            AnalysisFailurePolicy::ForwardRaw => Some(frame.clone()),
            AnalysisFailurePolicy::Skip => None,
        };

        let analyzed = panic::catch_unwind(AssertUnwindSafe(|| self.analyzer.analyze(frame)))
            .unwrap_or_else(|payload| Err(AnalysisError::Panicked(panic_message(&*payload))));

        let output = match (analyzed, raw) {
            (Ok(output), _) => output,
            (Err(e), raw) => {
                warn!(worker = self.id, frame = sequence, "Analysis failed: {}", e);
                metrics::counter!("vigil_analysis_failures_total").increment(1);
                match raw {
                    Some(raw) => raw,
                    None => return,
                }
            }
        };
        metrics::counter!("vigil_frames_processed_total").increment(1);

        if let Some(recording) = &self.recording {
            if let Err(e) = recording.write(&output) {
                warn!(worker = self.id, frame = sequence, "Failed to write frame: {}", e);
            }
        }
        trace!(worker = self.id, frame = sequence, queued = self.queue.len(), "Frame processed");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
