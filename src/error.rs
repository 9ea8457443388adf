//! Error taxonomy for the stream pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the video source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source {locator}: {reason}")]
    Open { locator: String, reason: String },

    #[error("no frame available: {0}")]
    Read(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures in the frame sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to initialize recording at {path}: {reason}")]
    Init { path: PathBuf, reason: String },

    #[error("sink is not initialized")]
    NotInitialized,

    #[error("frame {sequence} rejected: {reason}")]
    Write { sequence: u64, reason: String },

    #[error("failed to finalize recording: {0}")]
    Finalize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image encode error: {0}")]
    Image(#[from] image::ImageError),
}

/// Per-frame analysis failure; isolated to the frame that caused it
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("detector failed: {0}")]
    Detector(String),

    #[error("unsupported frame layout: {0}")]
    Layout(String),

    #[error("analyzer panicked: {0}")]
    Panicked(String),
}

/// Invalid or incomplete configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no frame analyzer attached")]
    MissingAnalyzer,

    #[error("result persistence requested but no frame sink attached")]
    MissingSink,

    #[error("no source connector attached")]
    MissingConnector,

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("no connector can open {0}")]
    UnsupportedSource(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Errors returned synchronously by `StreamProcessor::start`
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stream processor was already started")]
    AlreadyStarted,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
