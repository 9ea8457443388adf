//! GStreamer-based MP4 recorder fed from processed frames

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::SinkError;
use crate::output::FrameSink;

/// Encodes frames with x264 into an MP4 container.
///
/// Frames are timestamped by write order at the stream's nominal rate.
#[derive(Default)]
pub struct GstRecorder {
    inner: Mutex<Option<Recorder>>,
}

struct Recorder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    info: gst_video::VideoInfo,
    path: PathBuf,
    frame_duration_ns: u64,
    frames: u64,
}

impl GstRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Recorder>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recording file and muxer for an output path.
    ///
    /// Known container extensions pick their muxer; anything else gets
    /// `.mp4` appended.
    fn container_path(output_path: &Path) -> (PathBuf, &'static str) {
        let known = output_path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(muxer_for);
        match known {
            Some(muxer) => (output_path.to_path_buf(), muxer),
            None => {
                let mut name = output_path.as_os_str().to_owned();
                name.push(".mp4");
                (PathBuf::from(name), "mp4mux")
            }
        }
    }

    fn build_pipeline_string(path: &Path, muxer: &str) -> String {
        format!(
            "appsrc name=appsrc ! \
             videoconvert ! \
             x264enc ! \
             {} ! \
             filesink location=\"{}\"",
            muxer,
            path.display()
        )
    }

    fn open(output_path: &Path, fps: f64, frame_size: (u32, u32)) -> Result<Recorder, SinkError> {
        let (path, muxer) = Self::container_path(output_path);
        let init_err = |reason: String| SinkError::Init {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        gst::init().map_err(|e| init_err(format!("failed to initialize GStreamer: {}", e)))?;

        let fps = if fps > 0.0 { fps } else { 30.0 };
        let millis = (fps * 1000.0).round() as i32;
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, frame_size.0, frame_size.1)
            .fps(gst::Fraction::new(millis, 1000))
            .build()
            .map_err(|e| init_err(e.to_string()))?;
        let caps = info.to_caps().map_err(|e| init_err(e.to_string()))?;

        let pipeline_str = Self::build_pipeline_string(&path, muxer);
        debug!("Pipeline: {}", pipeline_str);
        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| init_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| init_err("failed to create pipeline".into()))?;
        let appsrc = pipeline
            .by_name("appsrc")
            .ok_or_else(|| init_err("failed to find appsrc".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| init_err("failed to cast to AppSrc".into()))?;

        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", true);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| init_err(format!("failed to start pipeline: {:?}", e)))?;

        info!("Video file opened for writing: {}", path.display());
        Ok(Recorder {
            pipeline,
            appsrc,
            info,
            path,
            frame_duration_ns: (1e9 / fps) as u64,
            frames: 0,
        })
    }
}

fn muxer_for(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => Some("mp4mux"),
        "mov" => Some("qtmux"),
        "mkv" => Some("matroskamux"),
        "avi" => Some("avimux"),
        _ => None,
    }
}

impl Recorder {
    fn push(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let write_err = |reason: String| SinkError::Write {
            sequence: frame.sequence(),
            reason,
        };
        if frame.dimensions() != (self.info.width(), self.info.height()) {
            return Err(write_err(format!(
                "frame is {:?}, recording is {}x{}",
                frame.dimensions(),
                self.info.width(),
                self.info.height()
            )));
        }
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| write_err("malformed pixel buffer".into()))?;

        let row_len = (self.info.width() * 3) as usize;
        let stride = self.info.stride()[0] as usize;
        let mut buffer =
            gst::Buffer::with_size(self.info.size()).map_err(|e| write_err(e.to_string()))?;
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| write_err("buffer is not writable".into()))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(self.frames * self.frame_duration_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(self.frame_duration_ns));
            let mut map = buffer
                .map_writable()
                .map_err(|_| write_err("failed to map buffer".into()))?;
            for (dst, src) in map
                .as_mut_slice()
                .chunks_mut(stride)
                .zip(image.as_raw().chunks(row_len))
            {
                dst[..row_len].copy_from_slice(src);
            }
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| write_err(format!("{:?}", e)))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self) -> Result<(), SinkError> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("Failed to send EOS to recorder: {:?}", e);
        }

        if let Some(bus) = self.pipeline.bus() {
            if let Some(msg) = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(10),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) {
                if let gst::MessageView::Error(err) = msg.view() {
                    error!(
                        error = %err.error(),
                        debug = ?err.debug(),
                        "GStreamer error while finalizing recording"
                    );
                }
            } else {
                warn!("Recorder did not reach end of stream in time");
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| SinkError::Finalize(format!("{:?}", e)))?;
        info!(
            "Video file finalized: {} ({} frames)",
            self.path.display(),
            self.frames
        );
        Ok(())
    }
}

impl FrameSink for GstRecorder {
    fn init(&self, output_path: &Path, fps: f64, frame_size: (u32, u32)) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if let Some(recorder) = inner.as_ref() {
            if recorder.path == Self::container_path(output_path).0 {
                debug!("Continuing recording at {}", recorder.path.display());
                return Ok(());
            }
        }
        if let Some(previous) = inner.take() {
            previous.finish()?;
        }
        *inner = Some(Self::open(output_path, fps, frame_size)?);
        Ok(())
    }

    fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        match self.lock().as_mut() {
            Some(recorder) => recorder.push(frame),
            None => Err(SinkError::NotInitialized),
        }
    }

    fn release(&self) -> Result<(), SinkError> {
        match self.lock().take() {
            Some(recorder) => recorder.finish(),
            None => Ok(()),
        }
    }
}
