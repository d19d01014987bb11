//! Database models for the swarm supervisor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Project record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub status: String,
    pub swarm_pid: Option<i64>,
    pub archived_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    /// Parsed status; unknown values read as `Stopped`.
    pub fn status(&self) -> ProjectStatus {
        ProjectStatus::parse(&self.status).unwrap_or(ProjectStatus::Stopped)
    }
}

/// Swarm run record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SwarmRun {
    pub id: i64,
    pub project_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: String,
    pub stop_reason: Option<String>,
    pub phase_number: i64,
    pub tasks_completed: i64,
    /// JSON array of agent names launched in this run.
    pub agent_names: String,
    pub summary: Option<String>,
    pub label: Option<String>,
    pub notes: Option<String>,
    pub guardrail_results: Option<String>,
    /// JSON object mapping agent name to its latest PID.
    pub agent_pids: String,
}

impl SwarmRun {
    pub fn status(&self) -> RunStatus {
        RunStatus::parse(&self.status).unwrap_or(RunStatus::Crashed)
    }

    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn agents(&self) -> Vec<String> {
        serde_json::from_str(&self.agent_names).unwrap_or_default()
    }

    pub fn agent_pids(&self) -> BTreeMap<String, i64> {
        serde_json::from_str(&self.agent_pids).unwrap_or_default()
    }
}

/// Checkpoint record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub id: i64,
    pub project_id: String,
    pub run_id: i64,
    pub agent_name: String,
    pub checkpoint_type: String,
    pub data: String,
    pub created_at: i64,
}

/// Project status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Running,
    Stopped,
    Completed,
}

impl ProjectStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Crashed,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "stopped" => Some(Self::Stopped),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }

    /// Project status a project takes once a run closes with this status.
    pub const fn project_status(self) -> ProjectStatus {
        match self {
            Self::Running => ProjectStatus::Running,
            Self::Completed => ProjectStatus::Completed,
            Self::Stopped | Self::Crashed => ProjectStatus::Stopped,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a run was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop request.
    User,
    /// Maximum run duration exceeded.
    Watchdog,
    /// Every agent exited on its own.
    AgentsExited,
    /// Repaired at startup after the supervisor itself restarted.
    Reconciled,
    /// Repaired on a status read or launch that found a dead swarm PID.
    Stale,
    /// Supervisor shut down while the run was active.
    Shutdown,
}

impl StopReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Watchdog => "watchdog",
            Self::AgentsExited => "agents_exited",
            Self::Reconciled => "reconciled",
            Self::Stale => "stale",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
