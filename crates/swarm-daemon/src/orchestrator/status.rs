//! Read-side operations: status, output, input, checkpoints.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::SwarmSupervisor;
use super::types::StatusReport;
use crate::error::SupervisorError;
use crate::output::{self, OutputPage, OutputStream, StreamOptions};
use crate::process::AgentSnapshot;
use crate::reconcile::{repair_project, swarm_alive};
use crate::storage::{Checkpoint, ProjectStatus, RunAnnotation, StopReason, SwarmRun};

impl SwarmSupervisor {
    /// Status of a project's swarm.
    ///
    /// A project persisted as `running` that has no active run here and
    /// none of whose recorded PIDs is alive is repaired on the spot: its
    /// open runs are closed as crashed and it moves to `stopped`.
    pub async fn get_status(&self, project_id: &str) -> Result<StatusReport, SupervisorError> {
        let shared = &self.inner;
        let _guard = shared.locks.lock(project_id).await;

        let mut project = shared.db.get_project(project_id).await?;
        let run_state = shared
            .runs
            .read()
            .await
            .get(project_id)
            .map(|run| run.control.state());

        let mut corrected = false;
        if run_state.is_none()
            && project.status() == ProjectStatus::Running
            && !swarm_alive(&shared.db, &project).await?
        {
            warn!(project_id, swarm_pid = ?project.swarm_pid, "Stale running state, repairing");
            repair_project(&shared.db, project_id, StopReason::Stale).await?;
            project = shared.db.get_project(project_id).await?;
            corrected = true;
        }

        let run = match shared.db.open_run_for_project(project_id).await? {
            Some(run) => Some(run),
            None => shared.db.latest_run_for_project(project_id).await?,
        };

        let agents: Vec<AgentSnapshot> = shared
            .registry
            .list_for_project(project_id)
            .await
            .iter()
            .map(|handle| handle.snapshot())
            .collect();

        // Agents that already exited are only visible through the buffer.
        let last_buffered = shared
            .output
            .read(project_id, None, -1, 1)
            .await
            .lines
            .last()
            .map(|line| line.timestamp);
        let last_output_at = agents
            .iter()
            .filter_map(|agent| agent.last_output_at)
            .chain(last_buffered)
            .max();

        Ok(StatusReport {
            project_id: project.id,
            project_status: project.status,
            swarm_pid: project.swarm_pid,
            run_state,
            run,
            agents,
            last_output_at,
            usage: shared.quota.usage(project_id).await,
            corrected,
        })
    }

    /// Page through buffered output: the combined buffer, or one agent's.
    ///
    /// Negative offsets count back from the newest line.
    pub async fn read_output(
        &self,
        project_id: &str,
        agent: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<OutputPage, SupervisorError> {
        self.inner.db.get_project(project_id).await?;
        Ok(self
            .inner
            .output
            .read(project_id, agent, offset, limit)
            .await)
    }

    /// Follow output from `from_offset` until no drain worker remains.
    pub async fn subscribe_output(
        &self,
        project_id: &str,
        agent: Option<String>,
        from_offset: i64,
    ) -> Result<OutputStream, SupervisorError> {
        self.inner.db.get_project(project_id).await?;
        let settings = &self.inner.config.supervisor;

        Ok(output::subscribe(
            Arc::clone(&self.inner.output),
            Arc::clone(&self.inner.registry),
            project_id.to_string(),
            agent,
            from_offset,
            StreamOptions {
                poll_interval: Duration::from_millis(settings.stream_poll_millis.max(1)),
                keepalive_every: settings.keepalive_every_polls,
            },
        )
        .await)
    }

    /// Write one line to an agent's stdin; the run's first agent by default.
    pub async fn send_input(
        &self,
        project_id: &str,
        agent: Option<&str>,
        text: &str,
    ) -> Result<(), SupervisorError> {
        let shared = &self.inner;
        shared.db.get_project(project_id).await?;

        let run_agents = shared
            .runs
            .read()
            .await
            .get(project_id)
            .map(|run| run.agents.clone());
        let registered = shared.registry.list_for_project(project_id).await;
        if run_agents.is_none() && registered.is_empty() {
            return Err(SupervisorError::NotRunning {
                project_id: project_id.to_string(),
            });
        }

        let target = match agent {
            Some(name) => name.to_string(),
            None => run_agents
                .as_ref()
                .and_then(|agents| agents.first().cloned())
                .or_else(|| registered.first().map(|h| h.agent().to_string()))
                .ok_or_else(|| SupervisorError::NotRunning {
                    project_id: project_id.to_string(),
                })?,
        };

        let handle = registered.iter().find(|h| h.agent() == target);
        let Some(handle) = handle else {
            let known = run_agents
                .as_ref()
                .is_some_and(|agents| agents.contains(&target));
            return Err(if known {
                SupervisorError::AgentExited { agent: target }
            } else {
                SupervisorError::NotFound(format!("Agent {target} in project {project_id}"))
            });
        };
        if !handle.is_alive() {
            return Err(SupervisorError::AgentExited { agent: target });
        }

        handle.write_stdin(text).await.map_err(|e| {
            warn!(project_id, agent = %target, error = %e, "Stdin write failed");
            SupervisorError::Io(e)
        })
    }

    /// Checkpoints of a run in arrival order, pending ones included.
    pub async fn list_checkpoints(
        &self,
        run_id: i64,
        agent: Option<&str>,
    ) -> Result<Vec<Checkpoint>, SupervisorError> {
        let shared = &self.inner;
        shared.db.get_run(run_id).await?;
        if let Err(e) = shared.batcher.flush_run(run_id).await {
            warn!(run_id, error = %e, "Checkpoint flush before listing failed");
        }
        Ok(shared.db.list_checkpoints(run_id, agent).await?)
    }

    /// Set label, notes, summary or guardrail results of any run.
    pub async fn annotate_run(
        &self,
        run_id: i64,
        annotation: &RunAnnotation,
    ) -> Result<SwarmRun, SupervisorError> {
        Ok(self.inner.db.annotate_run(run_id, annotation).await?)
    }

    /// A project's runs, newest first.
    pub async fn list_runs(&self, project_id: &str) -> Result<Vec<SwarmRun>, SupervisorError> {
        self.inner.db.get_project(project_id).await?;
        Ok(self.inner.db.list_runs_for_project(project_id).await?)
    }

    /// Forget buffers, quota usage, breaker history and the lock of a
    /// project that is not running.
    pub async fn remove_project_state(&self, project_id: &str) -> Result<(), SupervisorError> {
        let shared = &self.inner;
        {
            let _guard = shared.locks.lock(project_id).await;
            let tracked = shared.runs.read().await.contains_key(project_id);
            if tracked || shared.registry.has_active(project_id).await {
                return Err(SupervisorError::AlreadyRunning {
                    project_id: project_id.to_string(),
                });
            }

            shared.output.remove_project(project_id).await;
            shared.quota.reset(project_id).await;
            shared.breaker.remove_project(project_id).await;
        }
        shared.locks.remove(project_id).await;

        info!(project_id, "Project state removed");
        Ok(())
    }
}
