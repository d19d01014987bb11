//! Launch/stop orchestrator and the public supervisor facade.
//!
//! [`SwarmSupervisor`] owns every in-memory component (registry, output
//! buffers, quotas, breaker, checkpoint batcher) and is the only entry point
//! the surrounding application layer talks to:
//! - launch and stop swarms, restart single agents
//! - read and subscribe to agent output, write agent stdin
//! - status with stale-PID self-correction
//! - checkpoint listing and run annotation
//!
//! Launch, stop and restart of one project are serialized by a per-project
//! lock; projects never block each other.

mod launch;
mod locks;
mod status;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swarm_core::Config;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::CheckpointBatcher;
use crate::drain::{AgentExit, DrainEngine};
use crate::error::SupervisorError;
use crate::events::{EventBus, SwarmEvent};
use crate::output::OutputStore;
use crate::process::ProcessRegistry;
use crate::quota::{CircuitBreaker, QuotaManager};
use crate::reconcile::{self, ReconcileReport};
use crate::storage::{Database, RunStatus, StopReason};
use crate::supervisor::{RunControl, RunDeps};

pub use locks::ProjectLocks;
pub use types::{LaunchConfig, LaunchOutcome, StatusReport, StopOutcome, validate_agent_names};

/// In-memory record of a project's active run.
struct ActiveRun {
    run_id: i64,
    agents: Vec<String>,
    root: PathBuf,
    launch: Arc<LaunchConfig>,
    control: RunControl,
    exit_tx: mpsc::UnboundedSender<AgentExit>,
    /// Termination is under way; no restarts, no second close.
    stopping: bool,
    /// Restarts between terminating the old instance and registering the
    /// new one. The run is not closed as exited while any is pending.
    pending_restarts: usize,
}

/// State shared by the facade and the supervisor loops.
pub(crate) struct Shared {
    db: Database,
    config: Config,
    registry: Arc<ProcessRegistry>,
    output: Arc<OutputStore>,
    quota: Arc<QuotaManager>,
    breaker: Arc<CircuitBreaker>,
    batcher: Arc<CheckpointBatcher>,
    drain: DrainEngine,
    events: EventBus,
    locks: ProjectLocks,
    runs: RwLock<HashMap<String, ActiveRun>>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn run_deps(&self) -> RunDeps {
        RunDeps {
            registry: Arc::clone(&self.registry),
            quota: Arc::clone(&self.quota),
            breaker: Arc::clone(&self.breaker),
            events: self.events.clone(),
        }
    }

    /// Terminate the project's agents without holding the project lock,
    /// then close the run under it.
    async fn terminate_and_close(
        &self,
        project_id: &str,
        run_id: i64,
        status: RunStatus,
        reason: StopReason,
    ) -> Result<Option<i64>, SupervisorError> {
        self.registry.unregister_all(project_id).await;

        let _guard = self.locks.lock(project_id).await;
        {
            let mut runs = self.runs.write().await;
            if runs.get(project_id).is_some_and(|run| run.run_id == run_id) {
                runs.remove(project_id);
            }
        }
        self.close_run_record(project_id, run_id, status, reason)
            .await
    }

    /// Persist the end of a run and clear per-run state. Must be called with
    /// the project lock held.
    ///
    /// Returns the run's `ended_at`; a run closed earlier keeps its original
    /// value and nothing else is touched.
    async fn close_run_record(
        &self,
        project_id: &str,
        run_id: i64,
        status: RunStatus,
        reason: StopReason,
    ) -> Result<Option<i64>, SupervisorError> {
        let Some(ended_at) = self.db.close_run(run_id, status, reason).await? else {
            return Ok(self.db.get_run(run_id).await?.ended_at);
        };

        self.db
            .set_project_idle(project_id, status.project_status())
            .await?;
        self.quota.reset(project_id).await;

        if let Err(e) = self.batcher.flush_run(run_id).await {
            warn!(project_id, run_id, error = %e, "Final checkpoint flush failed, will retry");
        }
        self.batcher.forget_run(run_id).await;

        info!(
            project_id,
            run_id,
            status = status.as_str(),
            reason = reason.as_str(),
            "Run closed"
        );
        self.events.publish(SwarmEvent::RunEnded {
            project_id: project_id.to_string(),
            run_id,
            status: status.as_str().to_string(),
            stop_reason: reason.as_str().to_string(),
        });
        Ok(Some(ended_at))
    }
}

/// The swarm supervisor.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SwarmSupervisor {
    inner: Arc<Shared>,
}

impl SwarmSupervisor {
    pub fn new(db: Database, config: Config) -> Self {
        let settings = &config.supervisor;
        let events = EventBus::default();
        let registry = Arc::new(ProcessRegistry::new(Duration::from_secs(
            settings.terminate_timeout_secs,
        )));
        let output = Arc::new(OutputStore::new(settings.output_buffer_capacity));
        let quota = Arc::new(QuotaManager::new());
        let breaker = Arc::new(CircuitBreaker::new(
            Duration::from_secs(config.breaker.window_secs),
            config.breaker.threshold,
        ));
        let batcher = Arc::new(CheckpointBatcher::new(
            db.clone(),
            config.checkpoints.clone(),
            events.clone(),
        ));
        let drain = DrainEngine::new(
            Arc::clone(&registry),
            Arc::clone(&output),
            Arc::clone(&batcher),
            settings,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Shared {
                db,
                registry,
                output,
                quota,
                breaker,
                batcher,
                drain,
                events,
                locks: ProjectLocks::new(),
                runs: RwLock::new(HashMap::new()),
                shutdown_tx,
                flush_task: Mutex::new(None),
                config,
            }),
        }
    }

    /// Reconcile persisted state and start the checkpoint flush task.
    ///
    /// Call once, before serving requests.
    pub async fn start(&self) -> Result<ReconcileReport, SupervisorError> {
        let report = reconcile::reconcile(&self.inner.db).await?;

        let mut flush_task = self.inner.flush_task.lock().await;
        if flush_task.is_none() {
            *flush_task = Some(
                self.inner
                    .batcher
                    .spawn_flush_task(self.inner.shutdown_tx.subscribe()),
            );
        }
        drop(flush_task);

        info!(
            repaired = report.repaired.len(),
            untouched = report.untouched.len(),
            "Supervisor started"
        );
        Ok(report)
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Live events of every project.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    /// Projects with an active run.
    pub async fn running_projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.inner.runs.read().await.keys().cloned().collect();
        projects.sort();
        projects
    }

    /// Stop running projects (if configured), then flush checkpoints and
    /// stop the flush task.
    pub async fn shutdown(&self) {
        let shared = &self.inner;

        if shared.config.supervisor.stop_agents_on_shutdown {
            for project_id in self.running_projects().await {
                let run_id = {
                    let _guard = shared.locks.lock(&project_id).await;
                    shared.begin_stop(&project_id, None).await
                };
                let Some(run_id) = run_id else { continue };

                if let Err(e) = shared
                    .terminate_and_close(&project_id, run_id, RunStatus::Stopped, StopReason::Shutdown)
                    .await
                {
                    warn!(%project_id, run_id, error = %e, "Failed to close run on shutdown");
                }
            }
        } else {
            info!("Leaving agents running on shutdown");
        }

        let pending = shared.batcher.pending_count().await;
        if pending > 0 {
            info!(pending, "Flushing pending checkpoints");
        }
        shared.shutdown_tx.send_replace(true);
        let flush_task = shared.flush_task.lock().await.take();
        if let Some(task) = flush_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Checkpoint flush task panicked");
            }
        } else if let Err(e) = shared.batcher.flush().await {
            warn!(error = %e, "Final checkpoint flush failed");
        }

        info!("Supervisor shut down");
    }
}
