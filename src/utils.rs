use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::capture::{Connector, ImageSequenceConnector};
use crate::error::ConfigError;
use crate::output::FrameSink;
use crate::CaptureConfig;

/// Pick a connector able to open `locator`.
///
/// Directories stream their images; anything else needs GStreamer.
pub fn select_connector(
    locator: &str,
    config: &CaptureConfig,
) -> Result<Box<dyn Connector>, ConfigError> {
    if Path::new(locator).is_dir() {
        info!("Using image sequence source for {}", locator);
        return Ok(Box::new(ImageSequenceConnector::new(config.default_fps)));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    {
        info!("Using GStreamer source for {}", locator);
        return Ok(Box::new(crate::capture::GstConnector::new(config.default_fps)));
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    Err(ConfigError::UnsupportedSource(locator.to_string()))
}

/// Best available recording backend
pub fn default_sink() -> Arc<dyn FrameSink> {
    #[cfg(feature = "gstreamer-pipeline")]
    {
        Arc::new(crate::output::GstRecorder::new())
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Arc::new(crate::output::ImageSequenceSink::new())
    }
}
