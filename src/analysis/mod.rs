//! Frame analysis stage
//!
//! The pipeline only knows [`FrameAnalyzer`]. Concrete detection and
//! recognition models plug in behind it.

pub mod plate;

use crate::capture::Frame;
use crate::error::AnalysisError;

pub use plate::{normalize_plate_text, Detection, Detector, PlateAnalyzer, TextReader};

/// Turns a frame into an annotated frame of the same dimensions.
///
/// Called concurrently from every worker thread.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, frame: Frame) -> Result<Frame, AnalysisError>;
}

impl<F> FrameAnalyzer for F
where
    F: Fn(Frame) -> Result<Frame, AnalysisError> + Send + Sync,
{
    fn analyze(&self, frame: Frame) -> Result<Frame, AnalysisError> {
        self(frame)
    }
}

/// Forwards frames untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl FrameAnalyzer for PassThrough {
    fn analyze(&self, frame: Frame) -> Result<Frame, AnalysisError> {
        Ok(frame)
    }
}
