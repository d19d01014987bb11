//! Error taxonomy surfaced by the supervisor facade.
//!
//! Component errors (`RegistryError`, `QuotaError`, `SpawnError`, ...) are
//! translated into [`SupervisorError`] at the facade so that callers only ever
//! match on one enum.

use std::time::Duration;

use crate::checkpoint::CheckpointError;
use crate::process::{RegistryError, SpawnError};
use crate::quota::{BreakerOpen, QuotaError};
use crate::storage::DatabaseError;

/// Errors returned by [`crate::orchestrator::SwarmSupervisor`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Project {project_id} is already running")]
    AlreadyRunning { project_id: String },

    #[error("Project {project_id} is not running")]
    NotRunning { project_id: String },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(#[from] QuotaError),

    #[error("Circuit open for agent {agent}, retry in {}s", retry_after.as_secs())]
    CircuitOpen { agent: String, retry_after: Duration },

    #[error("Failed to spawn agent {agent}: {reason}")]
    SpawnFailed { agent: String, reason: String },

    #[error("Agent {agent} has exited")]
    AgentExited { agent: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl SupervisorError {
    /// Stable machine-readable kind for mapping to transport statuses.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning { .. } => "already_running",
            Self::NotRunning { .. } => "not_running",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::AgentExited { .. } => "agent_exited",
            Self::Io(_) => "io_error",
            Self::Validation(_) => "validation",
            Self::Database(_) => "database",
        }
    }
}

impl From<DatabaseError> for SupervisorError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

impl From<RegistryError> for SupervisorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered { project_id, .. } => {
                Self::AlreadyRunning { project_id }
            }
            RegistryError::NotFound { agent, .. } => Self::NotFound(format!("Agent {agent}")),
        }
    }
}

impl From<SpawnError> for SupervisorError {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::Launcher { agent, reason } | SpawnError::Os { agent, reason } => {
                Self::SpawnFailed { agent, reason }
            }
            SpawnError::MissingPipe { agent, pipe } => Self::SpawnFailed {
                agent,
                reason: format!("failed to capture {pipe}"),
            },
        }
    }
}

impl From<BreakerOpen> for SupervisorError {
    fn from(err: BreakerOpen) -> Self {
        Self::CircuitOpen {
            agent: err.agent,
            retry_after: err.retry_after,
        }
    }
}

impl From<CheckpointError> for SupervisorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Database(db) => db.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_not_found_maps_to_not_found() {
        let err: SupervisorError = DatabaseError::NotFound("Project x".to_string()).into();
        assert_eq!(err.kind(), "not_found");

        let err: SupervisorError = DatabaseError::Query("boom".to_string()).into();
        assert_eq!(err.kind(), "database");
    }

    #[test]
    fn quota_errors_are_retryable() {
        let err: SupervisorError = QuotaError::MaxAgents {
            requested: 3,
            limit: 2,
        }
        .into();
        assert_eq!(err.kind(), "quota_exceeded");
    }

    #[test]
    fn duplicate_registration_reads_as_already_running() {
        let err: SupervisorError = RegistryError::AlreadyRegistered {
            project_id: "p".to_string(),
            agent: "a".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "already_running");
    }
}
