//! Startup reconciliation of persisted run state against live processes.
//!
//! A supervisor that died (or was restarted) leaves projects marked
//! `running`. Before accepting requests the daemon checks each of them: if
//! none of the recorded PIDs (the swarm PID and every agent PID of the open
//! run) is alive, the project is moved to `stopped` and its open runs are
//! closed as `crashed`.

use serde::Serialize;
use tracing::{info, warn};

use crate::process::liveness;
use crate::storage::{Database, DatabaseError, Project, ProjectStatus, RunStatus, StopReason};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Projects found in `running`.
    pub inspected: usize,
    /// Projects with no live recorded process, repaired.
    pub repaired: Vec<String>,
    /// Projects with at least one live recorded process.
    pub untouched: Vec<String>,
    /// Open runs of projects that were not running.
    pub orphaned_runs_closed: u64,
}

/// Reconcile every project persisted as `running`.
pub async fn reconcile(db: &Database) -> Result<ReconcileReport, DatabaseError> {
    let running = db.list_projects_by_status(ProjectStatus::Running).await?;
    let mut report = ReconcileReport {
        inspected: running.len(),
        ..ReconcileReport::default()
    };

    for project in running {
        if swarm_alive(db, &project).await? {
            info!(project_id = %project.id, swarm_pid = ?project.swarm_pid, "Swarm still alive, leaving as running");
            report.untouched.push(project.id);
            continue;
        }

        warn!(project_id = %project.id, swarm_pid = ?project.swarm_pid, "Swarm processes gone, marking project stopped");
        repair_project(db, &project.id, StopReason::Reconciled).await?;
        report.repaired.push(project.id);
    }

    for run in db.list_orphaned_runs().await? {
        if db
            .close_run(run.id, RunStatus::Crashed, StopReason::Reconciled)
            .await?
            .is_some()
        {
            warn!(project_id = %run.project_id, run_id = run.id, "Closed orphaned run");
            report.orphaned_runs_closed += 1;
        }
    }

    info!(
        inspected = report.inspected,
        repaired = report.repaired.len(),
        orphaned_runs = report.orphaned_runs_closed,
        "Reconciliation complete"
    );
    Ok(report)
}

/// PIDs recorded for a project's swarm: its swarm PID plus every agent PID
/// of its open run.
pub async fn recorded_pids(db: &Database, project: &Project) -> Result<Vec<i64>, DatabaseError> {
    let mut pids: Vec<i64> = project.swarm_pid.into_iter().collect();
    if let Some(run) = db.open_run_for_project(&project.id).await? {
        pids.extend(run.agent_pids().into_values());
    }
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

/// Whether any recorded process of the project's swarm is still alive.
pub async fn swarm_alive(db: &Database, project: &Project) -> Result<bool, DatabaseError> {
    Ok(recorded_pids(db, project)
        .await?
        .into_iter()
        .any(liveness::pid_alive))
}

/// Close a project's open runs as crashed and move it to `stopped`.
///
/// Returns the number of runs closed.
pub async fn repair_project(
    db: &Database,
    project_id: &str,
    reason: StopReason,
) -> Result<u64, DatabaseError> {
    let closed = db
        .close_open_runs_for_project(project_id, RunStatus::Crashed, reason)
        .await?;
    db.set_project_idle(project_id, ProjectStatus::Stopped)
        .await?;
    info!(project_id, runs_closed = closed, reason = reason.as_str(), "Project state repaired");
    Ok(closed)
}
