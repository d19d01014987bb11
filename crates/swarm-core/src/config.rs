//! Configuration resolution for the swarm supervisor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/swarm/settings.json)
//! 3. Project config (.swarm/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub checkpoints: CheckpointSettings,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Process supervision limits and cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Lines retained per output buffer (also the page-size ceiling).
    pub output_buffer_capacity: usize,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout_secs: u64,
    /// Watchdog tick interval.
    pub watchdog_interval_secs: u64,
    /// Poll cadence of the output stream.
    pub stream_poll_millis: u64,
    /// Idle polls between keepalive events on the output stream.
    pub keepalive_every_polls: u32,
    pub default_max_agents: Option<u32>,
    pub default_max_restarts: Option<u32>,
    pub default_max_duration_hours: Option<f64>,
    /// Size at which an agent log file is rotated.
    pub log_max_bytes: u64,
    /// Rotated log files kept per agent.
    pub log_backups: u32,
    /// Log directory, relative to the project root.
    pub log_dir_name: PathBuf,
    pub stop_agents_on_shutdown: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            output_buffer_capacity: 5000,
            terminate_timeout_secs: 5,
            watchdog_interval_secs: 10,
            stream_poll_millis: 500,
            keepalive_every_polls: 30,
            default_max_agents: None,
            default_max_restarts: None,
            default_max_duration_hours: None,
            log_max_bytes: 10 * 1024 * 1024, // 10 MB
            log_backups: 3,
            log_dir_name: PathBuf::from(".swarm").join("logs"),
            stop_agents_on_shutdown: true,
        }
    }
}

/// External worker program used to start each agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LauncherSettings {
    /// Program to run. Relative paths containing a separator resolve against
    /// the project root; bare names are looked up on `PATH`.
    pub program: PathBuf,
    /// Arguments; `{agent}`, `{project}` and `{run}` are substituted.
    pub args: Vec<String>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./swarm-agent.sh"),
            args: vec!["{agent}".to_string()],
        }
    }
}

/// Crash-loop throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub window_secs: u64,
    /// The breaker opens once recent crashes exceed this count.
    pub threshold: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_secs: 300,
            threshold: 3,
        }
    }
}

/// Checkpoint batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub batch_size: usize,
    pub flush_interval_millis: u64,
    pub cooldown_millis: u64,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_millis: 2000,
            cooldown_millis: 5000,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".swarm").join("settings.json");
        if project_path.exists() {
            let overlay = load_overlay(&project_path)?;
            merge_overlay(&mut config, &overlay)?;
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("swarm").join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("swarm").join("swarm.db"))
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    serde_json::from_value(load_overlay(path)?).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn load_overlay(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Merge a partial JSON document over `base`.
///
/// Only keys present in the overlay replace values; nested objects merge
/// key by key so a project file can override a single field.
pub fn merge_overlay(base: &mut Config, overlay: &serde_json::Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_json(&mut merged, overlay);
    *base = serde_json::from_value(merged)?;
    Ok(())
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Apply `SWARM_*` environment overrides using the given lookup.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SWARM_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("SWARM_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(n) = lookup("SWARM_BUFFER_CAPACITY").and_then(|v| v.parse().ok()) {
        config.supervisor.output_buffer_capacity = n;
    }
    if let Some(n) = lookup("SWARM_TERMINATE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.supervisor.terminate_timeout_secs = n;
    }
    if let Some(n) = lookup("SWARM_WATCHDOG_INTERVAL").and_then(|v| v.parse().ok()) {
        config.supervisor.watchdog_interval_secs = n;
    }
    if let Some(n) = lookup("SWARM_MAX_AGENTS").and_then(|v| v.parse().ok()) {
        config.supervisor.default_max_agents = Some(n);
    }
    if let Some(n) = lookup("SWARM_MAX_RESTARTS").and_then(|v| v.parse().ok()) {
        config.supervisor.default_max_restarts = Some(n);
    }
    if let Some(n) = lookup("SWARM_MAX_DURATION_HOURS").and_then(|v| v.parse().ok()) {
        config.supervisor.default_max_duration_hours = Some(n);
    }
    if let Some(val) = lookup("SWARM_LAUNCHER") {
        config.launcher.program = PathBuf::from(val);
    }
}
