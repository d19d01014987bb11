//! Drain engine: pumps agent stdout/stderr into output buffers, rotating
//! log files and the checkpoint batcher.

mod engine;
mod log_file;
pub mod markers;

pub use engine::{AgentExit, DrainContext, DrainEngine, DrainPipes};
pub use log_file::RotatingLog;
