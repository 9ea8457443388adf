//! Frame sinks: where annotated frames are persisted

pub mod image_seq;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_recorder;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::capture::{Frame, StreamDescriptor};
use crate::error::SinkError;

pub use image_seq::ImageSequenceSink;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_recorder::GstRecorder;

/// Durable recording of processed frames.
///
/// Shared by every worker, so implementations serialize their own writes.
/// `init` may be called again after a reconnect; re-initializing with the
/// same path continues the same recording. `release` finalizes the
/// recording and is idempotent.
pub trait FrameSink: Send + Sync {
    fn init(&self, output_path: &Path, fps: f64, frame_size: (u32, u32)) -> Result<(), SinkError>;

    fn write(&self, frame: &Frame) -> Result<(), SinkError>;

    fn release(&self) -> Result<(), SinkError>;
}

/// A sink bound to one output path for the lifetime of a run.
///
/// Guarantees the sink is released at most once, and lets the capture
/// thread switch persistence off when the sink cannot be initialized.
pub struct Recording {
    sink: Arc<dyn FrameSink>,
    path: PathBuf,
    continue_without_sink: bool,
    enabled: AtomicBool,
    released: AtomicBool,
}

impl Recording {
    pub fn new(sink: Arc<dyn FrameSink>, path: PathBuf, continue_without_sink: bool) -> Self {
        Self {
            sink,
            path,
            continue_without_sink,
            enabled: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn continue_without_sink(&self) -> bool {
        self.continue_without_sink
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn init(&self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        info!("Initializing recording at {}", self.path.display());
        self.sink
            .init(&self.path, descriptor.fps, descriptor.frame_size())
    }

    /// Write a frame if persistence is still on
    pub fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.sink.write(frame)
    }

    /// Finalize the sink. Only the first call reaches it.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Saving result {}", self.path.display());
        if let Err(e) = self.sink.release() {
            error!("Failed to finalize recording {}: {}", self.path.display(), e);
        }
    }
}

/// Where the recording of `locator` goes: `output_dir/<basename>`.
///
/// The basename is the last non-empty path segment of the locator with
/// any query string or fragment removed.
pub fn output_path_for(locator: &str, output_dir: &Path) -> PathBuf {
    let without_query = locator
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let name = without_query
        .rsplit(|c: char| c == '/' || c == '\\')
        .find(|segment| !segment.is_empty() && !segment.ends_with(':'))
        .unwrap_or("stream");
    output_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_uses_locator_basename() {
        let dir = Path::new("result");
        assert_eq!(
            output_path_for("videos/anpr-demo-video.mp4", dir),
            dir.join("anpr-demo-video.mp4")
        );
        assert_eq!(
            output_path_for("rtsp://10.0.0.5:554/live/cam1?token=abc", dir),
            dir.join("cam1")
        );
        assert_eq!(output_path_for("frames/", dir), dir.join("frames"));
        assert_eq!(output_path_for("rtsp://", dir), dir.join("stream"));
        assert_eq!(output_path_for("", dir), dir.join("stream"));
    }
}
