//! One supervisor loop per active run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::watchdog::{RunState, TickVerdict, evaluate_tick};
use crate::drain::AgentExit;
use crate::events::{EventBus, SwarmEvent};
use crate::process::{AgentKey, ProcessRegistry};
use crate::quota::{CircuitBreaker, QuotaManager};
use crate::storage::{RunStatus, StopReason};

/// How the loop wants its run closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClose {
    pub status: RunStatus,
    pub reason: StopReason,
    /// Terminate remaining agents first (watchdog). When `false` the run is
    /// only closed if no agent is registered any more.
    pub terminate: bool,
}

/// Result of a close attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseResult {
    Closed,
    /// The run was already closed or replaced.
    NotCurrent,
    /// Agents are registered again, or a restart is replacing one.
    AgentsActive,
}

/// Closes runs on behalf of the loop, under the project lock.
pub trait RunCloser: Send + Sync + 'static {
    fn close_run(
        &self,
        project_id: &str,
        run_id: i64,
        close: RunClose,
    ) -> impl Future<Output = CloseResult> + Send;
}

/// Shared components the loop reads and updates.
#[derive(Clone)]
pub struct RunDeps {
    pub registry: Arc<ProcessRegistry>,
    pub quota: Arc<QuotaManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub events: EventBus,
}

/// Static parameters of a run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub project_id: String,
    pub run_id: i64,
    pub agents: Vec<String>,
    pub max_duration: Option<Duration>,
    pub tick: Duration,
}

/// Caller side of a spawned loop.
#[derive(Debug)]
pub struct RunControl {
    pub state_rx: watch::Receiver<RunState>,
    pub stop_tx: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl RunControl {
    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Move the loop to `Stopping`; it exits without touching the run.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Spawn the supervisor loop of a run.
pub fn spawn_run_loop<C: RunCloser>(
    closer: Arc<C>,
    deps: RunDeps,
    params: RunParams,
    exit_rx: mpsc::UnboundedReceiver<AgentExit>,
) -> RunControl {
    let (state_tx, state_rx) = watch::channel(RunState::Starting);
    let (stop_tx, stop_rx) = watch::channel(false);

    let run = RunLoop {
        closer,
        deps,
        params,
        state_tx,
        stop_rx,
        exit_rx,
        last_exits: HashMap::new(),
    };
    let task = tokio::spawn(run.run());

    RunControl {
        state_rx,
        stop_tx,
        task,
    }
}

struct RunLoop<C> {
    closer: Arc<C>,
    deps: RunDeps,
    params: RunParams,
    state_tx: watch::Sender<RunState>,
    stop_rx: watch::Receiver<bool>,
    exit_rx: mpsc::UnboundedReceiver<AgentExit>,
    last_exits: HashMap<String, AgentExit>,
}

impl<C: RunCloser> RunLoop<C> {
    fn set_state(&self, state: RunState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                project_id = %self.params.project_id,
                run_id = self.params.run_id,
                from = ?previous,
                to = ?state,
                "Run state changed"
            );
        }
    }

    async fn run(mut self) {
        let project_id = self.params.project_id.clone();
        let run_id = self.params.run_id;
        let started = Instant::now();

        if self.deps.registry.has_active(&project_id).await {
            self.set_state(RunState::Running);
        }

        let tick = self.params.tick.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(started + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(%project_id, run_id, max_duration = ?self.params.max_duration, "Supervisor loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    self.set_state(RunState::Stopping);
                    break;
                }
                Some(exit) = self.exit_rx.recv() => {
                    let expected = exit.expected;
                    self.on_exit(exit).await;
                    if !expected
                        && self.all_agents_reported()
                        && !self.deps.registry.has_active(&project_id).await
                        && self.finish_exited().await
                    {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let alive = self.deps.registry.has_active(&project_id).await;
                    if alive {
                        self.set_state(RunState::Running);
                    }
                    match evaluate_tick(started.elapsed(), self.params.max_duration, alive) {
                        TickVerdict::Continue => {}
                        TickVerdict::AllExited => {
                            while let Ok(exit) = self.exit_rx.try_recv() {
                                self.on_exit(exit).await;
                            }
                            if self.finish_exited().await {
                                break;
                            }
                        }
                        TickVerdict::DurationExceeded => {
                            warn!(%project_id, run_id, elapsed = ?started.elapsed(), "Run exceeded max duration, stopping");
                            self.set_state(RunState::WatchdogStopped);
                            let close = RunClose {
                                status: RunStatus::Stopped,
                                reason: StopReason::Watchdog,
                                terminate: true,
                            };
                            let result = self.closer.close_run(&project_id, run_id, close).await;
                            if result == CloseResult::Closed {
                                self.set_state(RunState::Closed);
                            }
                            break;
                        }
                    }
                }
            }
        }

        info!(%project_id, run_id, state = ?*self.state_tx.borrow(), "Supervisor loop finished");
    }

    async fn on_exit(&mut self, exit: AgentExit) {
        let project_id = &self.params.project_id;
        self.deps.quota.agent_exited(project_id).await;

        if !exit.expected && !exit.success() {
            self.deps
                .breaker
                .record_failure(&AgentKey::new(project_id.as_str(), exit.agent.as_str()), Instant::now())
                .await;
        }

        let code = exit.exit.and_then(|e| e.code);
        info!(%project_id, run_id = self.params.run_id, agent = %exit.agent, exit_code = ?code, expected = exit.expected, "Agent exited");
        self.deps.events.publish(SwarmEvent::AgentExited {
            project_id: project_id.clone(),
            run_id: self.params.run_id,
            agent: exit.agent.clone(),
            exit_code: code,
            expected: exit.expected,
        });

        self.last_exits.insert(exit.agent.clone(), exit);
    }

    fn all_agents_reported(&self) -> bool {
        self.params
            .agents
            .iter()
            .all(|agent| self.last_exits.contains_key(agent))
    }

    /// Every agent of the run ended successfully on its last exit.
    fn all_succeeded(&self) -> bool {
        self.params.agents.iter().all(|agent| {
            self.last_exits
                .get(agent)
                .is_some_and(AgentExit::success)
        })
    }

    /// Close the run after its agents exited on their own. Returns `true`
    /// when the loop should end.
    async fn finish_exited(&self) -> bool {
        let (state, status) = if self.all_succeeded() {
            (RunState::Completed, RunStatus::Completed)
        } else {
            (RunState::Crashed, RunStatus::Crashed)
        };
        self.set_state(state);

        let close = RunClose {
            status,
            reason: StopReason::AgentsExited,
            terminate: false,
        };
        match self
            .closer
            .close_run(&self.params.project_id, self.params.run_id, close)
            .await
        {
            CloseResult::Closed => {
                self.set_state(RunState::Closed);
                true
            }
            CloseResult::NotCurrent => true,
            CloseResult::AgentsActive => {
                self.set_state(RunState::Running);
                false
            }
        }
    }
}
