//! Database queries for the swarm supervisor.

use std::collections::BTreeMap;

use swarm_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Checkpoint, Project, ProjectStatus, RunStatus, StopReason, SwarmRun};

/// Checkpoint row awaiting insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub project_id: String,
    pub run_id: i64,
    pub agent_name: String,
    pub checkpoint_type: String,
    pub data: String,
    pub created_at: i64,
}

/// Annotation fields that stay editable after a run closes.
#[derive(Debug, Clone, Default)]
pub struct RunAnnotation {
    pub label: Option<String>,
    pub notes: Option<String>,
    pub summary: Option<String>,
    pub guardrail_results: Option<String>,
}

impl Database {
    // =========================================================================
    // Project queries
    // =========================================================================

    /// Create a new project.
    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        root_path: &str,
    ) -> Result<Project, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO projects (id, name, root_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(name)
        .bind(root_path)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_project(id).await
    }

    /// Get a project by ID.
    pub async fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {id}")))
    }

    /// List projects with the given status.
    pub async fn list_projects_by_status(
        &self,
        status: ProjectStatus,
    ) -> Result<Vec<Project>, DatabaseError> {
        let projects =
            sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE status = ? ORDER BY id")
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?;

        Ok(projects)
    }

    /// Mark a project running with a representative swarm PID.
    pub async fn set_project_running(
        &self,
        id: &str,
        swarm_pid: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE projects SET status = 'running', swarm_pid = ?, updated_at = ? WHERE id = ?")
            .bind(swarm_pid)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Move a project out of `running` and clear its swarm PID.
    pub async fn set_project_idle(
        &self,
        id: &str,
        status: ProjectStatus,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE projects SET status = ?, swarm_pid = NULL, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Archive a project.
    pub async fn archive_project(&self, id: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE projects SET archived_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    // =========================================================================
    // Swarm run queries
    // =========================================================================

    /// Open a new run for a project.
    pub async fn create_run(
        &self,
        project_id: &str,
        agent_names: &[String],
    ) -> Result<SwarmRun, DatabaseError> {
        let now = unix_timestamp();
        let agents_json = serde_json::to_string(agent_names).unwrap_or_else(|_| "[]".to_string());

        let result = sqlx::query(
            "INSERT INTO swarm_runs (project_id, started_at, status, agent_names) VALUES (?, ?, 'running', ?)",
        )
        .bind(project_id)
        .bind(now)
        .bind(&agents_json)
        .execute(self.pool())
        .await?;

        self.get_run(result.last_insert_rowid()).await
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: i64) -> Result<SwarmRun, DatabaseError> {
        sqlx::query_as::<_, SwarmRun>("SELECT * FROM swarm_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Run {id}")))
    }

    /// The project's open run, if any (newest first).
    pub async fn open_run_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<SwarmRun>, DatabaseError> {
        let run = sqlx::query_as::<_, SwarmRun>(
            "SELECT * FROM swarm_runs WHERE project_id = ? AND ended_at IS NULL ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(run)
    }

    /// The project's most recent run, open or closed.
    pub async fn latest_run_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<SwarmRun>, DatabaseError> {
        let run = sqlx::query_as::<_, SwarmRun>(
            "SELECT * FROM swarm_runs WHERE project_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(run)
    }

    /// List a project's runs, newest first.
    pub async fn list_runs_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<SwarmRun>, DatabaseError> {
        let runs = sqlx::query_as::<_, SwarmRun>(
            "SELECT * FROM swarm_runs WHERE project_id = ? ORDER BY id DESC",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        Ok(runs)
    }

    /// Runs still marked `running` whose project is not `running`.
    pub async fn list_orphaned_runs(&self) -> Result<Vec<SwarmRun>, DatabaseError> {
        let runs = sqlx::query_as::<_, SwarmRun>(
            r"
            SELECT r.* FROM swarm_runs r
            JOIN projects p ON p.id = r.project_id
            WHERE r.ended_at IS NULL AND p.status != 'running'
            ORDER BY r.id
            ",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(runs)
    }

    /// Close a run. Returns the `ended_at` it was closed with, or `None` if
    /// the run was already closed.
    pub async fn close_run(
        &self,
        id: i64,
        status: RunStatus,
        reason: StopReason,
    ) -> Result<Option<i64>, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE swarm_runs SET status = ?, stop_reason = ?, ended_at = ? WHERE id = ? AND ended_at IS NULL",
        )
        .bind(status.as_str())
        .bind(reason.as_str())
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok((result.rows_affected() == 1).then_some(now))
    }

    /// Close every open run of a project. Returns the number closed.
    pub async fn close_open_runs_for_project(
        &self,
        project_id: &str,
        status: RunStatus,
        reason: StopReason,
    ) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE swarm_runs SET status = ?, stop_reason = ?, ended_at = ? WHERE project_id = ? AND ended_at IS NULL",
        )
        .bind(status.as_str())
        .bind(reason.as_str())
        .bind(now)
        .bind(project_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Record the PID of an agent of a run, replacing an earlier instance's.
    pub async fn record_agent_pid(
        &self,
        run_id: i64,
        agent_name: &str,
        pid: i64,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let current: String = sqlx::query_scalar("SELECT agent_pids FROM swarm_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Run {run_id}")))?;
        let mut pids: BTreeMap<String, i64> = serde_json::from_str(&current).unwrap_or_default();
        pids.insert(agent_name.to_string(), pid);
        let pids_json = serde_json::to_string(&pids).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE swarm_runs SET agent_pids = ? WHERE id = ?")
            .bind(&pids_json)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a run that never got going (failed launch).
    pub async fn delete_run(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM swarm_runs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Update annotation fields; `None` leaves a field untouched.
    pub async fn annotate_run(
        &self,
        id: i64,
        annotation: &RunAnnotation,
    ) -> Result<SwarmRun, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE swarm_runs SET
                label = COALESCE(?, label),
                notes = COALESCE(?, notes),
                summary = COALESCE(?, summary),
                guardrail_results = COALESCE(?, guardrail_results)
            WHERE id = ?
            ",
        )
        .bind(annotation.label.as_deref())
        .bind(annotation.notes.as_deref())
        .bind(annotation.summary.as_deref())
        .bind(annotation.guardrail_results.as_deref())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Run {id}")));
        }
        self.get_run(id).await
    }

    // =========================================================================
    // Checkpoint queries
    // =========================================================================

    /// Insert a batch of checkpoints in one transaction.
    ///
    /// `task-done` bumps the run's `tasks_completed`; a `phase-start` whose
    /// payload is an integer sets `phase_number`. Either the whole batch is
    /// written or nothing is.
    pub async fn insert_checkpoints(&self, batch: &[NewCheckpoint]) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        for cp in batch {
            sqlx::query(
                "INSERT INTO checkpoints (project_id, run_id, agent_name, checkpoint_type, data, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&cp.project_id)
            .bind(cp.run_id)
            .bind(&cp.agent_name)
            .bind(&cp.checkpoint_type)
            .bind(&cp.data)
            .bind(cp.created_at)
            .execute(&mut *tx)
            .await?;

            match cp.checkpoint_type.as_str() {
                "task-done" => {
                    sqlx::query(
                        "UPDATE swarm_runs SET tasks_completed = tasks_completed + 1 WHERE id = ?",
                    )
                    .bind(cp.run_id)
                    .execute(&mut *tx)
                    .await?;
                }
                "phase-start" => {
                    if let Ok(phase) = cp.data.trim().parse::<i64>() {
                        sqlx::query("UPDATE swarm_runs SET phase_number = ? WHERE id = ?")
                            .bind(phase)
                            .bind(cp.run_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
                _ => {}
            }
        }

        tx.commit().await?;

        Ok(batch.len() as u64)
    }

    /// List a run's checkpoints in insertion order.
    pub async fn list_checkpoints(
        &self,
        run_id: i64,
        agent_name: Option<&str>,
    ) -> Result<Vec<Checkpoint>, DatabaseError> {
        let checkpoints = if let Some(agent) = agent_name {
            sqlx::query_as::<_, Checkpoint>(
                "SELECT * FROM checkpoints WHERE run_id = ? AND agent_name = ? ORDER BY id ASC",
            )
            .bind(run_id)
            .bind(agent)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Checkpoint>(
                "SELECT * FROM checkpoints WHERE run_id = ? ORDER BY id ASC",
            )
            .bind(run_id)
            .fetch_all(self.pool())
            .await?
        };

        Ok(checkpoints)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.create_project("p1", "Project One", "/tmp/p1").await.unwrap();
        db
    }

    fn checkpoint(run_id: i64, kind: &str, data: &str) -> NewCheckpoint {
        NewCheckpoint {
            project_id: "p1".to_string(),
            run_id,
            agent_name: "alpha".to_string(),
            checkpoint_type: kind.to_string(),
            data: data.to_string(),
            created_at: unix_timestamp(),
        }
    }

    #[tokio::test]
    async fn new_project_is_created_without_pid() {
        let db = test_db().await;
        let project = db.get_project("p1").await.unwrap();
        assert_eq!(project.status(), ProjectStatus::Created);
        assert!(project.swarm_pid.is_none());
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let db = test_db().await;
        assert!(matches!(
            db.get_project("nope").await.unwrap_err(),
            DatabaseError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn running_and_idle_transitions() {
        let db = test_db().await;
        db.set_project_running("p1", Some(4242)).await.unwrap();
        let project = db.get_project("p1").await.unwrap();
        assert_eq!(project.status(), ProjectStatus::Running);
        assert_eq!(project.swarm_pid, Some(4242));

        let running = db.list_projects_by_status(ProjectStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);

        db.set_project_idle("p1", ProjectStatus::Stopped).await.unwrap();
        let project = db.get_project("p1").await.unwrap();
        assert_eq!(project.status(), ProjectStatus::Stopped);
        assert!(project.swarm_pid.is_none());
    }

    #[tokio::test]
    async fn close_run_only_closes_once() {
        let db = test_db().await;
        let run = db.create_run("p1", &["alpha".to_string()]).await.unwrap();
        assert!(run.is_open());
        assert_eq!(run.agents(), vec!["alpha".to_string()]);

        let ended = db
            .close_run(run.id, RunStatus::Stopped, StopReason::User)
            .await
            .unwrap();
        assert!(ended.is_some());

        let again = db
            .close_run(run.id, RunStatus::Crashed, StopReason::Watchdog)
            .await
            .unwrap();
        assert!(again.is_none());

        let run = db.get_run(run.id).await.unwrap();
        assert_eq!(run.status(), RunStatus::Stopped);
        assert_eq!(run.stop_reason.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn open_run_lookup_ignores_closed_runs() {
        let db = test_db().await;
        let first = db.create_run("p1", &[]).await.unwrap();
        db.close_run(first.id, RunStatus::Completed, StopReason::AgentsExited)
            .await
            .unwrap();
        assert!(db.open_run_for_project("p1").await.unwrap().is_none());

        let second = db.create_run("p1", &[]).await.unwrap();
        let open = db.open_run_for_project("p1").await.unwrap().unwrap();
        assert_eq!(open.id, second.id);
        let latest = db.latest_run_for_project("p1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(db.list_runs_for_project("p1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn orphaned_runs_are_listed() {
        let db = test_db().await;
        let run = db.create_run("p1", &[]).await.unwrap();
        // project is still `created`, so the open run is orphaned
        let orphans = db.list_orphaned_runs().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, run.id);

        db.set_project_running("p1", None).await.unwrap();
        assert!(db.list_orphaned_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn annotation_survives_close() {
        let db = test_db().await;
        let run = db.create_run("p1", &[]).await.unwrap();
        db.close_run(run.id, RunStatus::Stopped, StopReason::User)
            .await
            .unwrap();

        let annotated = db
            .annotate_run(
                run.id,
                &RunAnnotation {
                    label: Some("nightly".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(annotated.label.as_deref(), Some("nightly"));
        assert_eq!(annotated.status(), RunStatus::Stopped);

        let err = db
            .annotate_run(9999, &RunAnnotation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn checkpoint_side_effects_update_run() {
        let db = test_db().await;
        let run = db.create_run("p1", &[]).await.unwrap();

        let written = db
            .insert_checkpoints(&[
                checkpoint(run.id, "phase-start", "3"),
                checkpoint(run.id, "task-done", "t-1"),
                checkpoint(run.id, "task-done", "t-2"),
                checkpoint(run.id, "phase-start", "not a number"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 4);

        let run = db.get_run(run.id).await.unwrap();
        assert_eq!(run.phase_number, 3);
        assert_eq!(run.tasks_completed, 2);

        let all = db.list_checkpoints(run.id, None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].checkpoint_type, "phase-start");
        assert_eq!(
            db.list_checkpoints(run.id, Some("beta")).await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let db = test_db().await;
        let run = db.create_run("p1", &[]).await.unwrap();

        let result = db
            .insert_checkpoints(&[
                checkpoint(run.id, "task-done", "ok"),
                checkpoint(run.id, "bogus-type", "rejected by CHECK"),
            ])
            .await;
        assert!(result.is_err());

        assert!(db.list_checkpoints(run.id, None).await.unwrap().is_empty());
        assert_eq!(db.get_run(run.id).await.unwrap().tasks_completed, 0);
    }

    #[tokio::test]
    async fn agent_pids_track_the_latest_instance() {
        let db = test_db().await;
        let run = db
            .create_run("p1", &["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert!(run.agent_pids().is_empty());

        db.record_agent_pid(run.id, "alpha", 100).await.unwrap();
        db.record_agent_pid(run.id, "beta", 101).await.unwrap();
        db.record_agent_pid(run.id, "alpha", 102).await.unwrap();

        let pids = db.get_run(run.id).await.unwrap().agent_pids();
        assert_eq!(pids.get("alpha"), Some(&102));
        assert_eq!(pids.get("beta"), Some(&101));

        let err = db.record_agent_pid(9999, "alpha", 1).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
