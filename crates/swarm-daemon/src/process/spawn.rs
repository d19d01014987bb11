//! Spawning the external worker program.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use swarm_core::config::LauncherSettings;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

/// Errors from spawning an agent.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Launcher unusable for agent {agent}: {reason}")]
    Launcher { agent: String, reason: String },

    #[error("Failed to start agent {agent}: {reason}")]
    Os { agent: String, reason: String },

    #[error("Failed to capture {pipe} of agent {agent}")]
    MissingPipe { agent: String, pipe: &'static str },
}

/// Everything needed to start one agent.
#[derive(Debug, Clone)]
pub struct SpawnConfig<'a> {
    pub project_id: &'a str,
    pub project_root: &'a Path,
    pub run_id: i64,
    pub agent: &'a str,
    pub launcher: &'a LauncherSettings,
    /// Extra environment, applied after the `SWARM_*` variables.
    pub env: &'a BTreeMap<String, String>,
}

/// A started child with its pipes taken out.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Resolve the launcher program against the project root.
///
/// Relative paths with more than one component (`./run.sh`, `bin/agent`)
/// are joined onto the root and must exist. Bare names are left for `PATH`
/// lookup.
pub fn resolve_program(project_root: &Path, program: &Path) -> Result<PathBuf, String> {
    if program.as_os_str().is_empty() {
        return Err("launcher program is empty".to_string());
    }

    let resolved = if program.is_absolute() {
        program.to_path_buf()
    } else if program.components().count() > 1 {
        project_root.join(program)
    } else {
        return Ok(program.to_path_buf());
    };

    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(format!("{} does not exist", resolved.display()))
    }
}

/// Substitute `{agent}`, `{project}` and `{run}` placeholders.
pub fn substitute_args(args: &[String], project_id: &str, agent: &str, run_id: i64) -> Vec<String> {
    let run = run_id.to_string();
    args.iter()
        .map(|arg| {
            arg.replace("{agent}", agent)
                .replace("{project}", project_id)
                .replace("{run}", &run)
        })
        .collect()
}

/// Start one agent with piped stdio.
pub fn spawn_agent(config: &SpawnConfig<'_>) -> Result<SpawnedAgent, SpawnError> {
    let agent = config.agent.to_string();

    if !config.project_root.is_dir() {
        return Err(SpawnError::Launcher {
            agent,
            reason: format!(
                "project root {} is not a directory",
                config.project_root.display()
            ),
        });
    }

    let program = resolve_program(config.project_root, &config.launcher.program)
        .map_err(|reason| SpawnError::Launcher {
            agent: agent.clone(),
            reason,
        })?;
    let args = substitute_args(
        &config.launcher.args,
        config.project_id,
        config.agent,
        config.run_id,
    );

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(config.project_root)
        .env("SWARM_PROJECT_ID", config.project_id)
        .env("SWARM_RUN_ID", config.run_id.to_string())
        .env("SWARM_AGENT_NAME", config.agent)
        .env("SWARM_PROJECT_ROOT", config.project_root)
        .envs(config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    info!(
        project_id = config.project_id,
        run_id = config.run_id,
        agent = config.agent,
        program = %program.display(),
        "Spawning agent"
    );

    let mut child = cmd.spawn().map_err(|e| SpawnError::Os {
        agent: agent.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id();

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.start_kill();
        return Err(SpawnError::MissingPipe {
            agent,
            pipe: "stdio",
        });
    };

    Ok(SpawnedAgent {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bare_program_names_use_path() {
        let root = tempfile::tempdir().unwrap();
        let resolved = resolve_program(root.path(), Path::new("sh")).unwrap();
        assert_eq!(resolved, PathBuf::from("sh"));
    }

    #[test]
    fn relative_launcher_must_exist_under_root() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_program(root.path(), Path::new("./swarm-agent.sh")).unwrap_err();
        assert!(err.contains("does not exist"));

        std::fs::write(root.path().join("swarm-agent.sh"), "#!/bin/sh\n").unwrap();
        let resolved = resolve_program(root.path(), Path::new("./swarm-agent.sh")).unwrap();
        assert!(resolved.starts_with(root.path()));
    }

    #[test]
    fn empty_program_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(resolve_program(root.path(), Path::new("")).is_err());
    }

    #[test]
    fn placeholders_are_substituted() {
        let args = vec![
            "--agent={agent}".to_string(),
            "{project}:{run}".to_string(),
            "plain".to_string(),
        ];
        assert_eq!(
            substitute_args(&args, "p1", "alpha", 7),
            vec!["--agent=alpha", "p1:7", "plain"]
        );
    }

    #[tokio::test]
    async fn spawned_agent_sees_swarm_env() {
        use tokio::io::AsyncReadExt;

        let root = tempfile::tempdir().unwrap();
        let launcher = LauncherSettings {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "echo \"$SWARM_PROJECT_ID $SWARM_RUN_ID $SWARM_AGENT_NAME $EXTRA\"".to_string(),
            ],
        };
        let env = BTreeMap::from([("EXTRA".to_string(), "yes".to_string())]);

        let mut spawned = spawn_agent(&SpawnConfig {
            project_id: "p1",
            project_root: root.path(),
            run_id: 3,
            agent: "alpha",
            launcher: &launcher,
            env: &env,
        })
        .unwrap();

        let mut out = String::new();
        spawned.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "p1 3 alpha yes");
        assert!(spawned.child.wait().await.unwrap().success());
    }

    #[test]
    fn missing_root_is_a_launcher_error() {
        let launcher = LauncherSettings::default();
        let env = BTreeMap::new();
        let err = spawn_agent(&SpawnConfig {
            project_id: "p1",
            project_root: Path::new("/definitely/not/here"),
            run_id: 1,
            agent: "alpha",
            launcher: &launcher,
            env: &env,
        })
        .unwrap_err();
        assert!(matches!(err, SpawnError::Launcher { .. }));
    }
}
