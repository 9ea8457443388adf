//! GStreamer-based source: any URI or file GStreamer can decode

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat, StreamDescriptor};
use crate::capture::source::{Connection, Connector};
use crate::error::SourceError;

/// How long a read may block before it counts as a failed read
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `is_open` waits for the pipeline to finish prerolling
const STATE_TIMEOUT_SECS: u64 = 5;

/// Negotiated frame size, if the caps carry a usable one
fn frame_size(info: Option<&gst_video::VideoInfo>) -> Option<(u32, u32)> {
    info.map(|info| (info.width(), info.height()))
        .filter(|(width, height)| *width > 0 && *height > 0)
}

/// Opens sources through a decode pipeline ending in an RGB appsink
pub struct GstConnector {
    fallback_fps: f64,
}

impl GstConnector {
    pub fn new(fallback_fps: f64) -> Self {
        Self { fallback_fps }
    }

    /// Build the decode pipeline string for a locator
    fn build_pipeline_string(locator: &str) -> String {
        let head = if locator.contains("://") {
            format!("uridecodebin uri=\"{}\"", locator)
        } else {
            format!("filesrc location=\"{}\" ! decodebin", locator)
        };
        format!(
            "{} ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=8",
            head
        )
    }
}

impl Connector for GstConnector {
    fn open(&mut self, locator: &str) -> Result<Box<dyn Connection>, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            locator: locator.to_string(),
            reason,
        };
        gst::init().map_err(|e| open_err(format!("failed to initialize GStreamer: {}", e)))?;

        let pipeline_str = Self::build_pipeline_string(locator);
        debug!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_err("failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("failed to cast to AppSink".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(format!("failed to start pipeline: {:?}", e)))?;

        Ok(Box::new(GstConnection {
            pipeline,
            appsink,
            fallback_fps: self.fallback_fps,
            released: false,
        }))
    }
}

struct GstConnection {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    fallback_fps: f64,
    released: bool,
}

impl GstConnection {
    fn negotiated_info(&self) -> Option<gst_video::VideoInfo> {
        let caps = self.appsink.static_pad("sink")?.current_caps()?;
        gst_video::VideoInfo::from_caps(&caps).ok()
    }
}

impl Connection for GstConnection {
    fn is_open(&self) -> bool {
        if self.released {
            return false;
        }
        if let Some(bus) = self.pipeline.bus() {
            if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
                if let gst::MessageView::Error(err) = msg.view() {
                    warn!(
                        error = %err.error(),
                        debug = ?err.debug(),
                        "GStreamer error while opening source"
                    );
                }
                return false;
            }
        }

        // Wait for preroll so the appsink caps are negotiated
        let (state_change, current, _) = self
            .pipeline
            .state(Some(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll) => {}
            Ok(gst::StateChangeSuccess::Async) => {
                debug!("Source pipeline still prerolling");
                return false;
            }
            Err(_) => return false,
        }
        if !matches!(current, gst::State::Playing | gst::State::Paused) {
            return false;
        }
        frame_size(self.negotiated_info().as_ref()).is_some()
    }

    fn descriptor(&self) -> StreamDescriptor {
        let info = self.negotiated_info();
        let (width, height) = frame_size(info.as_ref()).unwrap_or((0, 0));
        let fps = info
            .as_ref()
            .map(|info| info.fps())
            .filter(|fps| fps.numer() > 0 && fps.denom() > 0)
            .map(|fps| fps.numer() as f64 / fps.denom() as f64)
            .unwrap_or(self.fallback_fps);

        // Live sources report no duration; files get a floor estimate
        let total_frames = self
            .pipeline
            .query_duration::<gst::ClockTime>()
            .map(|duration| (duration.nseconds() as f64 / 1e9 * fps).floor() as u64)
            .filter(|total| *total > 0);

        StreamDescriptor {
            width,
            height,
            fps,
            total_frames,
        }
    }

    fn read_frame(&mut self, sequence: u64) -> Result<Frame, SourceError> {
        if self.released {
            return Err(SourceError::NotOpen);
        }
        let timeout = gst::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            let reason = if self.appsink.is_eos() {
                "end of stream"
            } else {
                "timed out waiting for a sample"
            };
            return Err(SourceError::Read(reason.into()));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| SourceError::Read("sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| SourceError::Read("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| SourceError::Read("failed to parse video info from caps".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| SourceError::Read("failed to map buffer".into()))?;

        Ok(Frame::new(
            Bytes::copy_from_slice(map.as_slice()),
            FrameMetadata {
                sequence,
                width: info.width(),
                height: info.height(),
                stride: info.stride()[0] as u32,
                format: PixelFormat::Rgb24,
            },
        ))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop source pipeline: {:?}", e);
        } else {
            info!("Source pipeline released");
        }
    }
}

impl Drop for GstConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uris_use_uridecodebin() {
        let pipeline = GstConnector::build_pipeline_string("rtsp://cam/live");
        assert!(pipeline.starts_with("uridecodebin uri=\"rtsp://cam/live\""));
        assert!(pipeline.contains("appsink name=appsink"));
    }

    #[test]
    fn missing_caps_have_no_frame_size() {
        assert_eq!(frame_size(None), None);

        gst::init().unwrap();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, 640, 480)
            .build()
            .unwrap();
        assert_eq!(frame_size(Some(&info)), Some((640, 480)));
    }

    #[test]
    fn paths_use_filesrc() {
        let pipeline = GstConnector::build_pipeline_string("clips/demo.mp4");
        assert!(pipeline.starts_with("filesrc location=\"clips/demo.mp4\" ! decodebin"));
    }
}
