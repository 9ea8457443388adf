pub mod analysis;
pub mod capture;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::queue::OverflowPolicy;

pub use capture::{Frame, FrameMetadata, PixelFormat, StreamDescriptor};
pub use pipeline::{StopReason, StreamProcessor};

/// Prefix for environment overrides, e.g. `VIGIL_PIPELINE__WORKERS=1`
pub const ENV_PREFIX: &str = "VIGIL";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Connection attempts per connect cycle
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Wait between opening a source and checking that it is open
    pub settle_delay_ms: u64,
    /// Frame rate reported by sources that have none, e.g. image directories
    pub default_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of frame processor threads
    pub workers: usize,
    /// How long an idle worker waits on the queue before re-checking state
    pub poll_timeout_ms: u64,
    /// `None` keeps the queue unbounded
    pub queue_capacity: Option<usize>,
    pub overflow: OverflowPolicy,
    pub on_analysis_failure: AnalysisFailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub save_result: bool,
    pub output_dir: PathBuf,
    /// Keep processing without persistence when the sink fails to initialize
    pub continue_without_sink: bool,
}

/// What happens to a frame whose analysis failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisFailurePolicy {
    #[default]
    Skip,
    ForwardRaw,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 5000,
            settle_delay_ms: 1000,
            default_fps: 30.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_timeout_ms: 100,
            queue_capacity: None,
            overflow: OverflowPolicy::Block,
            on_analysis_failure: AnalysisFailurePolicy::Skip,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_result: true,
            output_dir: PathBuf::from("result"),
            continue_without_sink: false,
        }
    }
}

impl CaptureConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `VIGIL_*` environment
    /// variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "pipeline.workers",
                reason: "at least one worker is required".into(),
            });
        }
        if self.capture.max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "capture.max_retries",
                reason: "at least one connection attempt is required".into(),
            });
        }
        if self.pipeline.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid {
                key: "pipeline.queue_capacity",
                reason: "a bounded queue needs room for one frame".into(),
            });
        }
        if !(self.capture.default_fps > 0.0) {
            return Err(ConfigError::Invalid {
                key: "capture.default_fps",
                reason: format!("{} is not a positive frame rate", self.capture.default_fps),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.capture.max_retries, 5);
        assert_eq!(config.capture.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.queue_capacity, None);
        assert_eq!(config.output.output_dir, PathBuf::from("result"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        fs::write(
            &path,
            r#"
[capture]
max_retries = 2

[pipeline]
workers = 1
queue_capacity = 64
overflow = "drop_oldest"
on_analysis_failure = "forward_raw"

[output]
save_result = false
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.max_retries, 2);
        assert_eq!(config.capture.retry_delay_ms, 5000);
        assert_eq!(config.pipeline.workers, 1);
        assert_eq!(config.pipeline.queue_capacity, Some(64));
        assert_eq!(config.pipeline.overflow, OverflowPolicy::DropOldest);
        assert_eq!(
            config.pipeline.on_analysis_failure,
            AnalysisFailurePolicy::ForwardRaw
        );
        assert!(!config.output.save_result);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::default();
        config.pipeline.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "pipeline.workers",
                ..
            })
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = Config::default();
        config.pipeline.queue_capacity = Some(0);
        assert!(config.validate().is_err());
    }
}
