//! Checkpoint batcher: progress events detected in agent output, buffered
//! and flushed to storage.

mod batcher;
mod types;

pub use batcher::CheckpointBatcher;
pub use types::{CheckpointError, CheckpointType};
