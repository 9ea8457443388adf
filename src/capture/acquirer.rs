//! Capture thread: connection lifecycle and frame acquisition

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::capture::frame::StreamDescriptor;
use crate::capture::source::{Connection, Connector};
use crate::output::Recording;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::state::{RunState, StopReason};
use crate::CaptureConfig;

/// Sole producer into the frame queue.
///
/// Owns the connector and every connection it opens; no other thread
/// touches them.
pub struct StreamAcquirer {
    locator: String,
    connector: Box<dyn Connector>,
    config: CaptureConfig,
    state: Arc<RunState>,
    queue: FrameQueue,
    recording: Option<Arc<Recording>>,
}

impl StreamAcquirer {
    pub fn new(
        locator: String,
        connector: Box<dyn Connector>,
        config: CaptureConfig,
        state: Arc<RunState>,
        queue: FrameQueue,
        recording: Option<Arc<Recording>>,
    ) -> Self {
        Self {
            locator,
            connector,
            config,
            state,
            queue,
            recording,
        }
    }

    /// Acquisition loop. Returns once the pipeline stops running.
    pub fn run(mut self) {
        info!("Capture started for {}", self.locator);

        while self.state.is_running() {
            let Some(mut conn) = self.connect() else {
                break;
            };
            let descriptor = conn.descriptor();
            self.pump(conn.as_mut(), &descriptor);
            conn.release();

            if self.state.is_running() {
                info!("Reconnecting to stream in {:?}", self.config.retry_delay());
                metrics::counter!("vigil_reconnects_total").increment(1);
                self.state.sleep(self.config.retry_delay());
            }
        }

        info!(frames = self.state.frame_count(), "Capture finished");
    }

    /// Open the source, retrying up to `max_retries` times.
    ///
    /// Exhausting the retry budget stops the whole pipeline.
    #[instrument(skip(self), fields(locator = %self.locator))]
    fn connect(&mut self) -> Option<Box<dyn Connection>> {
        let max_retries = self.config.max_retries;
        let mut retries = 0;

        while self.state.is_running() && retries < max_retries {
            match self.connector.open(&self.locator) {
                Ok(mut conn) => {
                    let running = self.state.sleep(self.config.settle_delay());
                    if !running {
                        conn.release();
                        return None;
                    }
                    if !conn.is_open() {
                        warn!("Source did not report itself open");
                    } else if !conn.descriptor().has_frame_size() {
                        warn!("Source is open but has not negotiated a frame size");
                    } else {
                        let descriptor = conn.descriptor();
                        self.on_connected(&descriptor);
                        if self.init_recording(&descriptor) {
                            return Some(conn);
                        }
                        conn.release();
                        return None;
                    }
                    conn.release();
                }
                Err(e) => warn!("Failed to open source: {}", e),
            }

            retries += 1;
            warn!(attempt = retries, "Connection failed, attempt {}/{}", retries, max_retries);
            self.state.sleep(self.config.retry_delay());
        }

        if retries >= max_retries {
            error!("Reconnection failed after {} attempts, stopping capture", max_retries);
            self.state.stop(StopReason::ConnectionFailed);
        }
        None
    }

    fn on_connected(&self, descriptor: &StreamDescriptor) {
        info!(
            "Connected to stream: {}x{} @ {:.2} fps",
            descriptor.width, descriptor.height, descriptor.fps
        );
        match descriptor.total_frames {
            Some(total) => info!("Finite source detected: {} frames", total),
            None => info!("Unbounded source or unknown frame count"),
        }
        self.state.publish_descriptor(*descriptor);
    }

    /// Start (or continue) the recording for this connection.
    /// Returns false when the failure is fatal to the pipeline.
    fn init_recording(&self, descriptor: &StreamDescriptor) -> bool {
        let Some(recording) = &self.recording else {
            return true;
        };
        if !recording.is_enabled() {
            return true;
        }

        match recording.init(descriptor) {
            Ok(()) => true,
            Err(e) if recording.continue_without_sink() => {
                error!("Failed to initialize recording, continuing without saving: {}", e);
                recording.disable();
                true
            }
            Err(e) => {
                error!("Failed to initialize recording, stopping capture: {}", e);
                self.state.stop(StopReason::SinkFailed);
                false
            }
        }
    }

    /// Read frames until the source finishes, fails or the pipeline stops
    fn pump(&self, conn: &mut dyn Connection, descriptor: &StreamDescriptor) {
        while self.state.is_running() {
            let sequence = self.state.frame_count() + 1;
            match conn.read_frame(sequence) {
                Ok(frame) => {
                    self.queue.push(frame, &self.state);
                    let count = self.state.record_frame();
                    metrics::counter!("vigil_frames_captured_total").increment(1);
                    if descriptor.is_exhausted(count) {
                        self.finish(count);
                        return;
                    }
                }
                Err(e) => {
                    let count = self.state.frame_count();
                    if descriptor.is_exhausted(count) {
                        self.finish(count);
                    } else {
                        warn!(frames = count, "Frame read failed: {}, reconnecting", e);
                    }
                    return;
                }
            }
        }
    }

    fn finish(&self, count: u64) {
        info!(frames = count, "Source exhausted, ending capture");
        self.state.stop(StopReason::SourceExhausted);
    }
}
