//! Sliding-window crash throttle per agent.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::process::AgentKey;

/// The breaker refused a (re)launch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for agent {agent}, retry after {retry_after:?}")]
pub struct BreakerOpen {
    pub agent: String,
    pub retry_after: Duration,
}

/// Counts unexpected exits per (project, agent) within `window`. Once the
/// count exceeds `threshold` the breaker is open until the oldest exit ages
/// out. It only advises; it never stops anything itself.
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Duration,
    threshold: usize,
    failures: Mutex<HashMap<AgentKey, VecDeque<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn prune(window: Duration, history: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = history.front() {
            if now.saturating_duration_since(*oldest) >= window {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an unexpected exit at `now`.
    pub async fn record_failure(&self, key: &AgentKey, now: Instant) {
        let mut failures = self.failures.lock().await;
        let history = failures.entry(key.clone()).or_default();
        Self::prune(self.window, history, now);
        history.push_back(now);

        if history.len() > self.threshold {
            warn!(%key, failures = history.len(), "Circuit breaker open");
        }
    }

    /// Whether `key` may be launched at `now`.
    pub async fn check(&self, key: &AgentKey, now: Instant) -> Result<(), BreakerOpen> {
        let mut failures = self.failures.lock().await;
        let Some(history) = failures.get_mut(key) else {
            return Ok(());
        };
        Self::prune(self.window, history, now);

        if history.len() > self.threshold
            && let Some(oldest) = history.front()
        {
            let retry_after = (*oldest + self.window).saturating_duration_since(now);
            return Err(BreakerOpen {
                agent: key.agent.clone(),
                retry_after,
            });
        }
        if history.is_empty() {
            failures.remove(key);
        }
        Ok(())
    }

    /// Forget every agent of a project.
    pub async fn remove_project(&self, project_id: &str) {
        let mut failures = self.failures.lock().await;
        let before = failures.len();
        failures.retain(|key, _| key.project_id != project_id);
        if failures.len() != before {
            info!(project_id, "Circuit breaker history cleared");
        }
    }
}
