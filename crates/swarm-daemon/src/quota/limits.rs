//! Per-project resource quotas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Limits for one launch. `None` means unlimited; `Some(0)` for
/// `max_agents` rejects every launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_agents: Option<u32>,
    pub max_restarts: Option<u32>,
}

/// Current consumption of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub live_agents: u32,
    /// Restarts since the project last left `running`.
    pub restarts: u32,
}

/// Errors from quota checks.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("{requested} agents requested, limit is {limit}")]
    MaxAgents { requested: u32, limit: u32 },

    #[error("{used} restarts used, limit is {limit}")]
    MaxRestarts { used: u32, limit: u32 },
}

#[derive(Debug, Default)]
struct ProjectQuota {
    limits: QuotaLimits,
    usage: ResourceUsage,
}

/// Tracks usage against limits for every project.
///
/// Checks have no side effects; usage only changes through the explicit
/// `commit_*`/`record_*` calls made once the guarded action succeeded.
#[derive(Debug, Default)]
pub struct QuotaManager {
    projects: RwLock<HashMap<String, ProjectQuota>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a launch of `requested` agents. Restart limits only gate
    /// [`Self::check_restart`].
    pub async fn check_launch(
        &self,
        project_id: &str,
        requested: u32,
        limits: QuotaLimits,
    ) -> Result<(), QuotaError> {
        let usage = self.usage(project_id).await;

        if let Some(limit) = limits.max_agents {
            let wanted = usage.live_agents.saturating_add(requested);
            if limit == 0 || wanted > limit {
                return Err(QuotaError::MaxAgents {
                    requested: wanted,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Record a successful launch and the limits it ran under.
    pub async fn commit_launch(&self, project_id: &str, agents: u32, limits: QuotaLimits) {
        let mut projects = self.projects.write().await;
        let quota = projects.entry(project_id.to_string()).or_default();
        quota.limits = limits;
        quota.usage.live_agents = quota.usage.live_agents.saturating_add(agents);
        debug!(project_id, usage = ?quota.usage, "Quota usage after launch");
    }

    /// Check one more restart against the limits of the current run.
    pub async fn check_restart(&self, project_id: &str) -> Result<(), QuotaError> {
        let projects = self.projects.read().await;
        let Some(quota) = projects.get(project_id) else {
            return Ok(());
        };
        match quota.limits.max_restarts {
            Some(limit) if quota.usage.restarts >= limit => Err(QuotaError::MaxRestarts {
                used: quota.usage.restarts,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Count a restart whose replacement process is running.
    pub async fn record_restart(&self, project_id: &str) {
        let mut projects = self.projects.write().await;
        let quota = projects.entry(project_id.to_string()).or_default();
        quota.usage.restarts = quota.usage.restarts.saturating_add(1);
        quota.usage.live_agents = quota.usage.live_agents.saturating_add(1);
    }

    /// An agent process ended.
    pub async fn agent_exited(&self, project_id: &str) {
        if let Some(quota) = self.projects.write().await.get_mut(project_id) {
            quota.usage.live_agents = quota.usage.live_agents.saturating_sub(1);
        }
    }

    /// Zero the project's usage (it left `running`).
    pub async fn reset(&self, project_id: &str) {
        if self.projects.write().await.remove(project_id).is_some() {
            debug!(project_id, "Quota usage reset");
        }
    }

    pub async fn usage(&self, project_id: &str) -> ResourceUsage {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(|q| q.usage)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limits(max_agents: Option<u32>, max_restarts: Option<u32>) -> QuotaLimits {
        QuotaLimits {
            max_agents,
            max_restarts,
        }
    }

    #[tokio::test]
    async fn unlimited_by_default() {
        let quota = QuotaManager::new();
        quota.check_launch("p1", 50, QuotaLimits::default()).await.unwrap();
    }

    #[tokio::test]
    async fn max_agents_is_enforced_without_side_effects() {
        let quota = QuotaManager::new();
        let err = quota
            .check_launch("p1", 3, limits(Some(2), None))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::MaxAgents { limit: 2, .. }));
        assert_eq!(quota.usage("p1").await, ResourceUsage::default());

        quota.check_launch("p1", 2, limits(Some(2), None)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_max_agents_always_rejects() {
        let quota = QuotaManager::new();
        assert!(quota.check_launch("p1", 0, limits(Some(0), None)).await.is_err());
    }

    #[tokio::test]
    async fn restarts_count_until_reset() {
        let quota = QuotaManager::new();
        quota.commit_launch("p1", 2, limits(None, Some(1))).await;

        quota.check_restart("p1").await.unwrap();
        quota.agent_exited("p1").await;
        quota.record_restart("p1").await;
        assert_eq!(
            quota.usage("p1").await,
            ResourceUsage {
                live_agents: 2,
                restarts: 1
            }
        );

        assert!(matches!(
            quota.check_restart("p1").await,
            Err(QuotaError::MaxRestarts { used: 1, limit: 1 })
        ));

        quota.reset("p1").await;
        assert_eq!(quota.usage("p1").await, ResourceUsage::default());
        quota.check_restart("p1").await.unwrap();
    }

    #[tokio::test]
    async fn spent_restart_budget_does_not_block_launch() {
        let quota = QuotaManager::new();
        quota.commit_launch("p1", 1, limits(Some(4), Some(1))).await;
        quota.record_restart("p1").await;
        assert!(quota.check_restart("p1").await.is_err());

        quota.check_launch("p1", 2, limits(Some(4), Some(1))).await.unwrap();
    }

    #[tokio::test]
    async fn exits_never_underflow() {
        let quota = QuotaManager::new();
        quota.commit_launch("p1", 1, QuotaLimits::default()).await;
        quota.agent_exited("p1").await;
        quota.agent_exited("p1").await;
        assert_eq!(quota.usage("p1").await.live_agents, 0);
    }
}
