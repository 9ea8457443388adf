//! Source contract: anything addressable that yields a readable frame sequence

use crate::capture::frame::{Frame, StreamDescriptor};
use crate::error::SourceError;

/// Opens connections to a video source.
///
/// A connector is moved into the capture thread and is the only way the
/// pipeline reaches the source, so it only needs to be `Send`.
pub trait Connector: Send + 'static {
    /// Begin opening `locator`. The returned connection may still be
    /// settling; the acquirer checks [`Connection::is_open`] after a short
    /// delay before trusting it.
    fn open(&mut self, locator: &str) -> Result<Box<dyn Connection>, SourceError>;
}

/// A live connection, owned exclusively by the capture thread
pub trait Connection: Send {
    /// Whether the source reports itself open and readable
    fn is_open(&self) -> bool;

    /// Stream properties as reported by the source
    fn descriptor(&self) -> StreamDescriptor;

    /// Read the next frame. `sequence` is the run-wide capture index the
    /// frame will carry.
    ///
    /// An error means no frame is available right now; the caller decides
    /// whether that is the end of a finite source or a transient failure.
    fn read_frame(&mut self, sequence: u64) -> Result<Frame, SourceError>;

    /// Release the underlying resources. Must be safe to call repeatedly.
    fn release(&mut self);
}

impl<F> Connector for F
where
    F: FnMut(&str) -> Result<Box<dyn Connection>, SourceError> + Send + 'static,
{
    fn open(&mut self, locator: &str) -> Result<Box<dyn Connection>, SourceError> {
        self(locator)
    }
}
