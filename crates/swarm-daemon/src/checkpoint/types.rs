//! Checkpoint types and errors.

use serde::{Deserialize, Serialize};

use crate::storage::DatabaseError;

/// Kind of progress event an agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointType {
    PhaseStart,
    PhaseComplete,
    TaskDone,
    Error,
}

impl CheckpointType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PhaseStart => "phase-start",
            Self::PhaseComplete => "phase-complete",
            Self::TaskDone => "task-done",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phase-start" => Some(Self::PhaseStart),
            "phase-complete" => Some(Self::PhaseComplete),
            "task-done" => Some(Self::TaskDone),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint flush failed: {0}")]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matches_as_str() {
        for kind in [
            CheckpointType::PhaseStart,
            CheckpointType::PhaseComplete,
            CheckpointType::TaskDone,
            CheckpointType::Error,
        ] {
            assert_eq!(CheckpointType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CheckpointType::parse("Task-Done"), None);
    }
}
