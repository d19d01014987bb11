//! Launch, stop and restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::types::{LaunchConfig, LaunchOutcome, StopOutcome, validate_agent_names};
use super::{ActiveRun, Shared, SwarmSupervisor};
use crate::drain::{AgentExit, DrainContext, DrainPipes};
use crate::error::SupervisorError;
use crate::events::SwarmEvent;
use crate::process::{AgentHandle, AgentKey, SpawnConfig, SpawnedAgent, liveness, signal, spawn_agent};
use crate::reconcile::{recorded_pids, repair_project, swarm_alive};
use crate::storage::{ProjectStatus, RunStatus, StopReason};
use crate::supervisor::{
    CloseResult, RunClose, RunCloser, RunParams, duration_from_hours, spawn_run_loop,
};

impl Shared {
    /// Spawn, register and drain one agent. Returns its PID.
    async fn start_agent(
        &self,
        project_id: &str,
        root: &Path,
        run_id: i64,
        agent: &str,
        launch: &LaunchConfig,
        exit_tx: &mpsc::UnboundedSender<AgentExit>,
    ) -> Result<Option<u32>, SupervisorError> {
        let launcher = launch.launcher_for(agent, &self.config.launcher);
        let SpawnedAgent {
            mut child,
            pid,
            stdin,
            stdout,
            stderr,
        } = spawn_agent(&SpawnConfig {
            project_id,
            project_root: root,
            run_id,
            agent,
            launcher,
            env: &launch.env,
        })?;

        if let Some(pid) = pid
            && let Err(e) = self.db.record_agent_pid(run_id, agent, i64::from(pid)).await
        {
            if let Err(kill_err) = child.start_kill() {
                warn!(project_id, agent, error = %kill_err, "Failed to kill unrecorded agent");
            }
            return Err(e.into());
        }

        let (handle, control) = AgentHandle::new(
            AgentKey::new(project_id, agent),
            run_id,
            pid,
            Some(stdin),
            self.drain.log_path(root, agent),
        );
        let handle = Arc::new(handle);

        if let Err(e) = self.registry.register(Arc::clone(&handle)).await {
            if let Err(kill_err) = child.start_kill() {
                warn!(project_id, agent, error = %kill_err, "Failed to kill unregistered agent");
            }
            return Err(e.into());
        }

        self.drain
            .attach(
                &handle,
                control,
                DrainPipes {
                    child,
                    stdout,
                    stderr,
                },
                DrainContext {
                    project_id: project_id.to_string(),
                    run_id,
                    exit_tx: exit_tx.clone(),
                },
            )
            .await;

        info!(project_id, run_id, agent, pid = ?pid, "Agent started");
        Ok(pid)
    }

    /// Undo a launch that failed after the run record was created.
    async fn unwind_launch(&self, project_id: &str, run_id: i64) {
        let stopped = self.registry.unregister_all(project_id).await;
        self.batcher.discard_run(run_id).await;
        self.quota.reset(project_id).await;
        if let Err(e) = self.db.delete_run(run_id).await {
            warn!(project_id, run_id, error = %e, "Failed to delete aborted run");
        }
        warn!(project_id, run_id, terminated = stopped.len(), "Launch unwound");
    }

    /// Flag the active run as stopping and signal its loop. Returns the run
    /// id, or `None` if there is no active run or it is already stopping.
    pub(super) async fn begin_stop(&self, project_id: &str, expected_run: Option<i64>) -> Option<i64> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(project_id)?;
        if run.stopping || expected_run.is_some_and(|id| id != run.run_id) {
            return None;
        }
        run.stopping = true;
        run.control.request_stop();
        Some(run.run_id)
    }
}

impl RunCloser for Shared {
    async fn close_run(&self, project_id: &str, run_id: i64, close: RunClose) -> CloseResult {
        let guard = self.locks.lock(project_id).await;

        if close.terminate {
            if self.begin_stop(project_id, Some(run_id)).await.is_none() {
                return CloseResult::NotCurrent;
            }
            drop(guard);
            if let Err(e) = self
                .terminate_and_close(project_id, run_id, close.status, close.reason)
                .await
            {
                warn!(project_id, run_id, error = %e, "Failed to close run");
            }
            return CloseResult::Closed;
        }

        let agents_active = self.registry.has_active(project_id).await;
        {
            let mut runs = self.runs.write().await;
            match runs.get(project_id) {
                Some(run) if run.run_id == run_id && !run.stopping => {
                    if agents_active || run.pending_restarts > 0 {
                        return CloseResult::AgentsActive;
                    }
                    runs.remove(project_id);
                }
                _ => return CloseResult::NotCurrent,
            }
        }

        if let Err(e) = self
            .close_run_record(project_id, run_id, close.status, close.reason)
            .await
        {
            warn!(project_id, run_id, error = %e, "Failed to close run");
        }
        drop(guard);
        CloseResult::Closed
    }
}

impl SwarmSupervisor {
    /// Start a swarm of `agents` for a project.
    ///
    /// Fails with `AlreadyRunning` if the project has an active run or a
    /// live swarm PID, `QuotaExceeded`/`CircuitOpen` if blocked, and
    /// `SpawnFailed` if any agent cannot be started. A failed launch
    /// terminates whatever it already started and leaves no run behind.
    pub async fn launch(
        &self,
        project_id: &str,
        agents: &[String],
        config: LaunchConfig,
    ) -> Result<LaunchOutcome, SupervisorError> {
        validate_agent_names(agents)?;
        let shared = &self.inner;
        let settings = &shared.config.supervisor;
        let _guard = shared.locks.lock(project_id).await;

        let project = shared.db.get_project(project_id).await?;
        if project.archived_at.is_some() {
            return Err(SupervisorError::Validation(format!(
                "project {project_id} is archived"
            )));
        }
        if shared.runs.read().await.contains_key(project_id) {
            return Err(SupervisorError::AlreadyRunning {
                project_id: project_id.to_string(),
            });
        }
        if project.status() == ProjectStatus::Running {
            if swarm_alive(&shared.db, &project).await? {
                return Err(SupervisorError::AlreadyRunning {
                    project_id: project_id.to_string(),
                });
            }
            warn!(project_id, swarm_pid = ?project.swarm_pid, "Replacing stale running state");
            repair_project(&shared.db, project_id, StopReason::Stale).await?;
        }

        let limits = config.limits(settings);
        let requested = u32::try_from(agents.len()).unwrap_or(u32::MAX);
        shared
            .quota
            .check_launch(project_id, requested, limits)
            .await?;
        let now = Instant::now();
        for agent in agents {
            shared
                .breaker
                .check(&AgentKey::new(project_id, agent.as_str()), now)
                .await?;
        }

        let run = shared.db.create_run(project_id, agents).await?;
        shared.output.reset_project(project_id).await;

        let root = PathBuf::from(&project.root_path);
        let launch = Arc::new(config);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let mut agent_pids = BTreeMap::new();
        for agent in agents {
            match shared
                .start_agent(project_id, &root, run.id, agent, &launch, &exit_tx)
                .await
            {
                Ok(pid) => {
                    agent_pids.insert(agent.clone(), pid);
                }
                Err(e) => {
                    warn!(project_id, run_id = run.id, agent = %agent, error = %e, "Agent failed to start");
                    shared.unwind_launch(project_id, run.id).await;
                    return Err(e);
                }
            }
        }

        shared
            .quota
            .commit_launch(project_id, requested, limits)
            .await;
        let swarm_pid = agent_pids.values().flatten().next().map(|pid| i64::from(*pid));
        if let Err(e) = shared.db.set_project_running(project_id, swarm_pid).await {
            shared.unwind_launch(project_id, run.id).await;
            return Err(e.into());
        }

        // Published before the loop exists so observers see it before any exit.
        shared.events.publish(SwarmEvent::RunStarted {
            project_id: project_id.to_string(),
            run_id: run.id,
            agents: agents.to_vec(),
        });

        let max_duration = duration_from_hours(launch.max_duration_hours(settings));
        let control = spawn_run_loop(
            Arc::clone(shared),
            shared.run_deps(),
            RunParams {
                project_id: project_id.to_string(),
                run_id: run.id,
                agents: agents.to_vec(),
                max_duration,
                tick: Duration::from_secs(settings.watchdog_interval_secs),
            },
            exit_rx,
        );

        shared.runs.write().await.insert(
            project_id.to_string(),
            ActiveRun {
                run_id: run.id,
                agents: agents.to_vec(),
                root,
                launch,
                control,
                exit_tx,
                stopping: false,
                pending_restarts: 0,
            },
        );

        info!(
            project_id,
            run_id = run.id,
            agents = agents.len(),
            swarm_pid = ?swarm_pid,
            max_duration = ?max_duration,
            "Swarm launched"
        );

        Ok(LaunchOutcome {
            run_id: run.id,
            agent_pids,
        })
    }

    /// Stop a project's swarm. A project that is not running is a no-op.
    ///
    /// Agents get SIGTERM and the configured grace period before SIGKILL;
    /// the project lock is not held while waiting for them.
    pub async fn stop(&self, project_id: &str) -> Result<StopOutcome, SupervisorError> {
        let shared = &self.inner;
        let guard = shared.locks.lock(project_id).await;
        let project = shared.db.get_project(project_id).await?;

        if let Some(run_id) = shared.begin_stop(project_id, None).await {
            drop(guard);
            info!(project_id, run_id, "Stopping swarm");
            let ended_at = shared
                .terminate_and_close(project_id, run_id, RunStatus::Stopped, StopReason::User)
                .await?;
            return Ok(StopOutcome {
                run_id: Some(run_id),
                ended_at,
                was_running: true,
            });
        }

        if let Some(run_id) = shared
            .runs
            .read()
            .await
            .get(project_id)
            .map(|run| run.run_id)
        {
            // Another caller is already stopping this run.
            return Ok(StopOutcome {
                run_id: Some(run_id),
                ended_at: None,
                was_running: true,
            });
        }

        if project.status() != ProjectStatus::Running {
            return Ok(StopOutcome::default());
        }

        // Persisted as running but not tracked here: the swarm was started
        // by an earlier supervisor instance. Its records are closed before
        // any process is signalled.
        let pids = recorded_pids(&shared.db, &project).await?;
        let open_run = shared.db.open_run_for_project(project_id).await?;
        shared
            .db
            .close_open_runs_for_project(project_id, RunStatus::Stopped, StopReason::User)
            .await?;
        shared
            .db
            .set_project_idle(project_id, ProjectStatus::Stopped)
            .await?;
        shared.quota.reset(project_id).await;

        let mut signalled = 0usize;
        for pid in pids.into_iter().filter(|pid| liveness::pid_alive(*pid)) {
            let Ok(pid) = u32::try_from(pid) else { continue };
            match signal::send_terminate(pid) {
                Ok(()) => signalled += 1,
                Err(e) => warn!(project_id, pid, error = %e, "Failed to signal untracked agent"),
            }
        }

        let (run_id, ended_at) = match open_run {
            Some(run) => (Some(run.id), shared.db.get_run(run.id).await?.ended_at),
            None => (None, None),
        };
        info!(project_id, run_id = ?run_id, signalled, "Stopped untracked swarm");
        Ok(StopOutcome {
            run_id,
            ended_at,
            was_running: true,
        })
    }

    /// Relaunch one agent inside the active run.
    ///
    /// A live old instance is terminated first; that exit is expected and
    /// not counted by the circuit breaker.
    pub async fn restart_agent(
        &self,
        project_id: &str,
        agent: &str,
    ) -> Result<Option<u32>, SupervisorError> {
        let shared = &self.inner;
        let key = AgentKey::new(project_id, agent);

        let run_id = {
            let _guard = shared.locks.lock(project_id).await;
            let run_id = self.restartable_run(project_id, agent).await?;
            shared.breaker.check(&key, Instant::now()).await?;
            shared.quota.check_restart(project_id).await?;
            if let Some(run) = shared.runs.write().await.get_mut(project_id) {
                run.pending_restarts += 1;
            }
            run_id
        };

        // NotFound here only means the old instance already finished.
        if let Ok(exit) = shared.registry.unregister(project_id, agent).await {
            info!(project_id, agent, exit_code = ?exit.and_then(|e| e.code), "Old instance stopped for restart");
        }

        let _guard = shared.locks.lock(project_id).await;
        if let Some(run) = shared.runs.write().await.get_mut(project_id)
            && run.run_id == run_id
        {
            run.pending_restarts = run.pending_restarts.saturating_sub(1);
        }
        // The run may have been stopped while the old instance was terminating.
        if self.restartable_run(project_id, agent).await? != run_id {
            return Err(SupervisorError::NotRunning {
                project_id: project_id.to_string(),
            });
        }
        let (root, launch, exit_tx) = {
            let runs = shared.runs.read().await;
            let run = runs
                .get(project_id)
                .ok_or_else(|| SupervisorError::NotRunning {
                    project_id: project_id.to_string(),
                })?;
            (run.root.clone(), Arc::clone(&run.launch), run.exit_tx.clone())
        };

        let pid = shared
            .start_agent(project_id, &root, run_id, agent, &launch, &exit_tx)
            .await?;
        shared.quota.record_restart(project_id).await;

        info!(project_id, run_id, agent, pid = ?pid, "Agent restarted");
        shared.events.publish(SwarmEvent::AgentRestarted {
            project_id: project_id.to_string(),
            run_id,
            agent: agent.to_string(),
            pid,
        });
        Ok(pid)
    }

    /// Id of the active run if `agent` belongs to it and it is not stopping.
    async fn restartable_run(&self, project_id: &str, agent: &str) -> Result<i64, SupervisorError> {
        let runs = self.inner.runs.read().await;
        let run = runs
            .get(project_id)
            .filter(|run| !run.stopping)
            .ok_or_else(|| SupervisorError::NotRunning {
                project_id: project_id.to_string(),
            })?;
        if !run.agents.iter().any(|name| name == agent) {
            return Err(SupervisorError::NotFound(format!(
                "Agent {agent} in project {project_id}"
            )));
        }
        Ok(run.run_id)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use swarm_core::Config;
    use swarm_core::config::LauncherSettings;

    use super::*;
    use crate::storage::Database;

    async fn supervisor(root: &Path) -> SwarmSupervisor {
        let db = Database::open_in_memory().await.unwrap();
        db.create_project("p1", "P1", root.to_str().unwrap())
            .await
            .unwrap();
        let mut config = Config::default();
        config.launcher = LauncherSettings {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
        };
        config.supervisor.terminate_timeout_secs = 2;
        SwarmSupervisor::new(db, config)
    }

    const EXITED: RunClose = RunClose {
        status: RunStatus::Completed,
        reason: StopReason::AgentsExited,
        terminate: false,
    };

    #[tokio::test]
    async fn pending_restart_keeps_an_empty_run_open() {
        let root = tempfile::tempdir().unwrap();
        let sup = supervisor(root.path()).await;
        let shared = &sup.inner;
        let launched = sup
            .launch("p1", &["alpha".to_string()], LaunchConfig::default())
            .await
            .unwrap();

        // Old instance gone, replacement not registered yet.
        shared.runs.write().await.get_mut("p1").unwrap().pending_restarts += 1;
        shared.registry.unregister_all("p1").await;

        assert_eq!(
            shared.close_run("p1", launched.run_id, EXITED).await,
            CloseResult::AgentsActive
        );
        assert!(shared.db.get_run(launched.run_id).await.unwrap().is_open());

        shared.runs.write().await.get_mut("p1").unwrap().pending_restarts = 0;
        assert_eq!(
            shared.close_run("p1", launched.run_id, EXITED).await,
            CloseResult::Closed
        );
        let run = shared.db.get_run(launched.run_id).await.unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn every_agent_pid_is_recorded_on_the_run() {
        let root = tempfile::tempdir().unwrap();
        let sup = supervisor(root.path()).await;
        let launched = sup
            .launch(
                "p1",
                &["alpha".to_string(), "beta".to_string()],
                LaunchConfig::default(),
            )
            .await
            .unwrap();

        let recorded = sup.db().get_run(launched.run_id).await.unwrap().agent_pids();
        for (agent, pid) in &launched.agent_pids {
            assert_eq!(recorded.get(agent).copied(), pid.map(i64::from));
        }

        let new_pid = sup.restart_agent("p1", "beta").await.unwrap();
        let recorded = sup.db().get_run(launched.run_id).await.unwrap().agent_pids();
        assert_eq!(recorded.get("beta").copied(), new_pid.map(i64::from));

        sup.stop("p1").await.unwrap();
    }
}
