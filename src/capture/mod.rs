pub mod acquirer;
pub mod frame;
pub mod image_seq;
pub mod source;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use acquirer::StreamAcquirer;
pub use frame::{Frame, FrameMetadata, PixelFormat, StreamDescriptor};
pub use image_seq::ImageSequenceConnector;
pub use source::{Connection, Connector};

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstConnector;
