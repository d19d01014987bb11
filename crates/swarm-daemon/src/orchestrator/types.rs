//! Request and response types of the supervisor facade.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use swarm_core::config::{LauncherSettings, SupervisorSettings};

use crate::error::SupervisorError;
use crate::process::AgentSnapshot;
use crate::quota::{QuotaLimits, ResourceUsage};
use crate::storage::SwarmRun;
use crate::supervisor::RunState;

/// Per-launch overrides. Unset limits fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub max_agents: Option<u32>,
    pub max_restarts: Option<u32>,
    pub max_duration_hours: Option<f64>,
    /// Extra environment for every agent.
    pub env: BTreeMap<String, String>,
    /// Launcher overrides keyed by agent name.
    pub agent_commands: HashMap<String, LauncherSettings>,
}

impl LaunchConfig {
    pub fn limits(&self, defaults: &SupervisorSettings) -> QuotaLimits {
        QuotaLimits {
            max_agents: self.max_agents.or(defaults.default_max_agents),
            max_restarts: self.max_restarts.or(defaults.default_max_restarts),
        }
    }

    pub fn max_duration_hours(&self, defaults: &SupervisorSettings) -> Option<f64> {
        self.max_duration_hours
            .or(defaults.default_max_duration_hours)
    }

    /// Launcher for `agent`: its override, else `default`.
    pub fn launcher_for<'a>(
        &'a self,
        agent: &str,
        default: &'a LauncherSettings,
    ) -> &'a LauncherSettings {
        self.agent_commands.get(agent).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub run_id: i64,
    pub agent_pids: BTreeMap<String, Option<u32>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopOutcome {
    pub run_id: Option<i64>,
    pub ended_at: Option<i64>,
    /// `false` when the call was a no-op.
    pub was_running: bool,
}

/// Result of `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_id: String,
    pub project_status: String,
    pub swarm_pid: Option<i64>,
    /// In-memory state machine of the active run, if any.
    pub run_state: Option<RunState>,
    /// The open run, else the most recent one.
    pub run: Option<SwarmRun>,
    pub agents: Vec<AgentSnapshot>,
    pub last_output_at: Option<i64>,
    pub usage: ResourceUsage,
    /// Stale persisted state was repaired during this call.
    pub corrected: bool,
}

/// Agent names become file names and environment values.
pub fn validate_agent_names(agents: &[String]) -> Result<(), SupervisorError> {
    if agents.is_empty() {
        return Err(SupervisorError::Validation(
            "at least one agent is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for name in agents {
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if name.is_empty() || name == "." || name == ".." || !valid_chars {
            return Err(SupervisorError::Validation(format!(
                "invalid agent name {name:?}"
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(SupervisorError::Validation(format!(
                "duplicate agent name {name:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn agent_names_are_checked() {
        assert!(validate_agent_names(&names(&["planner", "worker-1", "qa.v2"])).is_ok());
        assert!(validate_agent_names(&[]).is_err());
        assert!(validate_agent_names(&names(&["a/b"])).is_err());
        assert!(validate_agent_names(&names(&[".."])).is_err());
        assert!(validate_agent_names(&names(&[""])).is_err());

        let err = validate_agent_names(&names(&["a", "a"])).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn limits_fall_back_to_defaults() {
        let defaults = SupervisorSettings {
            default_max_agents: Some(4),
            default_max_restarts: Some(2),
            default_max_duration_hours: Some(1.5),
            ..SupervisorSettings::default()
        };
        let config = LaunchConfig {
            max_agents: Some(8),
            ..LaunchConfig::default()
        };

        let limits = config.limits(&defaults);
        assert_eq!(limits.max_agents, Some(8));
        assert_eq!(limits.max_restarts, Some(2));
        assert_eq!(config.max_duration_hours(&defaults), Some(1.5));
    }

    #[test]
    fn launcher_override_per_agent() {
        let default = LauncherSettings::default();
        let special = LauncherSettings {
            program: PathBuf::from("python3"),
            args: vec!["reviewer.py".to_string()],
        };
        let config = LaunchConfig {
            agent_commands: HashMap::from([("reviewer".to_string(), special.clone())]),
            ..LaunchConfig::default()
        };

        assert_eq!(config.launcher_for("reviewer", &default), &special);
        assert_eq!(config.launcher_for("coder", &default), &default);
    }

    #[test]
    fn launch_config_deserializes_partially() {
        let config: LaunchConfig =
            serde_json::from_str(r#"{"max_agents": 3, "env": {"MODE": "ci"}}"#).unwrap();
        assert_eq!(config.max_agents, Some(3));
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("ci"));
        assert!(config.agent_commands.is_empty());
    }
}
