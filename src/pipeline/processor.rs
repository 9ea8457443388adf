//! Stream processor: owns the run state and the capture/worker threads

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::analysis::FrameAnalyzer;
use crate::capture::{Connector, StreamAcquirer, StreamDescriptor};
use crate::error::{ConfigError, PipelineError};
use crate::output::{output_path_for, FrameSink, Recording};
use crate::pipeline::queue::{FrameQueue, QueueStats};
use crate::pipeline::state::{RunState, StopReason};
use crate::pipeline::worker::{panic_message, FrameProcessor};
use crate::Config;

/// Single-source pipeline: one capture thread feeding N frame processors.
///
/// `running` is true from construction until the first of: `stop()`, the
/// end of a finite source, or a spent retry budget. It never comes back.
pub struct StreamProcessor {
    locator: String,
    config: Config,
    /// Handed to the capture thread on start
    connector: Mutex<Option<Box<dyn Connector>>>,
    analyzer: Option<Arc<dyn FrameAnalyzer>>,
    sink: Option<Arc<dyn FrameSink>>,
    state: Arc<RunState>,
    queue: FrameQueue,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: bool,
}

pub struct StreamProcessorBuilder {
    locator: String,
    config: Config,
    connector: Option<Box<dyn Connector>>,
    analyzer: Option<Arc<dyn FrameAnalyzer>>,
    sink: Option<Arc<dyn FrameSink>>,
}

impl StreamProcessorBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn connector(self, connector: impl Connector) -> Self {
        self.boxed_connector(Box::new(connector))
    }

    pub fn boxed_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn save_result(mut self, save: bool) -> Self {
        self.config.output.save_result = save;
        self
    }

    pub fn build(self) -> StreamProcessor {
        let queue = FrameQueue::with_capacity(
            self.config.pipeline.queue_capacity,
            self.config.pipeline.overflow,
        );
        StreamProcessor {
            locator: self.locator,
            config: self.config,
            connector: Mutex::new(self.connector),
            analyzer: self.analyzer,
            sink: self.sink,
            state: RunState::new(),
            queue,
            handles: Mutex::new(Vec::new()),
            started: false,
        }
    }
}

impl StreamProcessor {
    pub fn builder(locator: impl Into<String>) -> StreamProcessorBuilder {
        StreamProcessorBuilder {
            locator: locator.into(),
            config: Config::default(),
            connector: None,
            analyzer: None,
            sink: None,
        }
    }

    /// Spawn the capture thread and the worker pool, then return.
    ///
    /// Fails before spawning anything if a required collaborator is missing.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyStarted);
        }
        self.config.validate()?;
        let analyzer = self.analyzer.clone().ok_or(ConfigError::MissingAnalyzer)?;
        let save_result = self.config.output.save_result;
        if save_result && self.sink.is_none() {
            return Err(ConfigError::MissingSink.into());
        }
        let connector = self
            .connector
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConfigError::MissingConnector)?;
        self.started = true;

        info!("Starting stream processing for {}", self.locator);

        let recording = match (&self.sink, save_result) {
            (Some(sink), true) => Some(Arc::new(Recording::new(
                sink.clone(),
                output_path_for(&self.locator, &self.config.output.output_dir),
                self.config.output.continue_without_sink,
            ))),
            _ => None,
        };

        let acquirer = StreamAcquirer::new(
            self.locator.clone(),
            connector,
            self.config.capture.clone(),
            self.state.clone(),
            self.queue.clone(),
            recording.clone(),
        );
        let state = self.state.clone();
        state.set_capturing(true);
        let spawned = self.spawn("capture".to_string(), move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| acquirer.run())) {
                error!("Capture thread panicked: {}", panic_message(&*payload));
                state.stop(StopReason::ConnectionFailed);
            }
            state.set_capturing(false);
        });
        if let Err(e) = spawned {
            self.state.set_capturing(false);
            self.state.stop(StopReason::Requested);
            return Err(e);
        }

        let workers = self.config.pipeline.workers;
        let active = Arc::new(AtomicUsize::new(workers));
        for id in 0..workers {
            let worker = FrameProcessor {
                id,
                state: self.state.clone(),
                queue: self.queue.clone(),
                analyzer: analyzer.clone(),
                recording: recording.clone(),
                poll_timeout: self.config.pipeline.poll_timeout(),
                on_failure: self.config.pipeline.on_analysis_failure,
                active: active.clone(),
            };
            if let Err(e) = self.spawn(format!("process-{}", id), move || worker.run()) {
                // Workers id.. never ran and will never check out.
                let missing = workers - id;
                if active.fetch_sub(missing, Ordering::AcqRel) == missing {
                    if let Some(recording) = &recording {
                        recording.release();
                    }
                }
                self.stop();
                return Err(e);
            }
        }

        info!(workers, "Stream processing started");
        Ok(())
    }

    fn spawn<F>(&self, name: String, body: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| PipelineError::Spawn { name, source })?;
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Stop capture, let the workers drain the queue, and join every thread.
    ///
    /// Idempotent. Blocks until each thread finishes its current unit of
    /// work; a hung analyzer call hangs this too.
    pub fn stop(&self) {
        self.state.stop(StopReason::Requested);

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if handles.is_empty() {
            return;
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }
        info!(frames = self.frame_count(), "Stream processing stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn frame_count(&self) -> u64 {
        self.state.frame_count()
    }

    /// Properties of the current (or last) connection
    pub fn descriptor(&self) -> Option<StreamDescriptor> {
        self.state.descriptor()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.stop_reason()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Block until `running` goes false or `timeout` elapses
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.state.wait_for_stop(timeout)
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
