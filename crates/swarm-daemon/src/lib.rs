//! Swarm Supervisor Library
//!
//! Process lifecycle core for agent swarms:
//! - Spawning and tracking agent processes per project
//! - Draining agent output into bounded buffers, log files and checkpoints
//! - Quotas and a crash-loop circuit breaker
//! - A per-run supervisor loop with a duration watchdog
//! - Startup reconciliation of persisted state

pub mod checkpoint;
pub mod drain;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod quota;
pub mod reconcile;
pub mod storage;
pub mod supervisor;

pub use error::SupervisorError;
pub use orchestrator::{LaunchConfig, SwarmSupervisor};
