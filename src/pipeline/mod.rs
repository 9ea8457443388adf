//! Frame pipeline: shared run state, queue, workers and the orchestrator

pub mod processor;
pub mod queue;
pub mod state;
pub mod worker;

pub use processor::{StreamProcessor, StreamProcessorBuilder};
pub use queue::{FrameQueue, OverflowPolicy, QueueStats};
pub use state::{RunState, StopReason};
pub use worker::FrameProcessor;
