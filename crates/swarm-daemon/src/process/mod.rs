//! Process registry and the spawning primitive for agent processes.

mod handle;
pub mod liveness;
mod registry;
pub mod signal;
mod spawn;

pub use handle::{AgentControl, AgentHandle, AgentKey, AgentSnapshot, ExitInfo};
pub use registry::{ProcessRegistry, RegistryError};
pub use spawn::{SpawnConfig, SpawnError, SpawnedAgent, resolve_program, spawn_agent, substitute_args};
