//! Registry of live agent processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::{AgentHandle, AgentKey, ExitInfo};
use super::signal;

/// How long to wait for the reaper after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long to wait for a cancelled drain worker to flush and finish.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent {agent} of project {project_id} is already running")]
    AlreadyRegistered { project_id: String, agent: String },

    #[error("Agent {agent} of project {project_id} not found")]
    NotFound { project_id: String, agent: String },
}

/// Tracks every agent process the supervisor started.
///
/// The map lock is only held for lookups and mutations, never while a
/// process is being waited on.
#[derive(Debug)]
pub struct ProcessRegistry {
    handles: RwLock<HashMap<AgentKey, Arc<AgentHandle>>>,
    terminate_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new(terminate_timeout: Duration) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            terminate_timeout,
        }
    }

    /// Track a freshly spawned process.
    ///
    /// Fails if a live process is already registered under the same key. A
    /// dead leftover is replaced.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn register(&self, handle: Arc<AgentHandle>) -> Result<AgentKey, RegistryError> {
        let key = handle.key().clone();
        let mut handles = self.handles.write().await;

        if let Some(existing) = handles.get(&key)
            && existing.is_alive()
        {
            return Err(RegistryError::AlreadyRegistered {
                project_id: key.project_id,
                agent: key.agent,
            });
        }

        debug!(%key, pid = ?handle.pid(), instance = %handle.instance(), "Registered agent");
        handles.insert(key.clone(), handle);
        Ok(key)
    }

    pub async fn lookup(
        &self,
        project_id: &str,
        agent: &str,
    ) -> Result<Arc<AgentHandle>, RegistryError> {
        self.handles
            .read()
            .await
            .get(&AgentKey::new(project_id, agent))
            .map(Arc::clone)
            .ok_or_else(|| RegistryError::NotFound {
                project_id: project_id.to_string(),
                agent: agent.to_string(),
            })
    }

    /// Handles of a project, ordered by agent name.
    pub async fn list_for_project(&self, project_id: &str) -> Vec<Arc<AgentHandle>> {
        let mut handles: Vec<_> = self
            .handles
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(_, handle)| Arc::clone(handle))
            .collect();
        handles.sort_by(|a, b| a.agent().cmp(b.agent()));
        handles
    }

    /// Whether any drain worker is still attached for the project.
    pub async fn has_active(&self, project_id: &str) -> bool {
        self.handles
            .read()
            .await
            .keys()
            .any(|key| key.project_id == project_id)
    }

    /// Remove a handle, but only if it is still the given instance.
    ///
    /// Called by a drain worker when it finishes; a replacement registered
    /// by a restart is left alone.
    pub async fn remove_if_instance(&self, key: &AgentKey, instance: Uuid) -> bool {
        let mut handles = self.handles.write().await;
        if handles.get(key).is_some_and(|h| h.instance() == instance) {
            handles.remove(key);
            true
        } else {
            false
        }
    }

    /// Stop one agent and forget it.
    ///
    /// A live process gets SIGTERM and the configured grace period, then
    /// SIGKILL. Its drain worker is cancelled and joined, which flushes the
    /// log file.
    pub async fn unregister(
        &self,
        project_id: &str,
        agent: &str,
    ) -> Result<Option<ExitInfo>, RegistryError> {
        let handle = self.lookup(project_id, agent).await?;
        let exits = self.terminate(vec![handle]).await;
        Ok(exits.into_iter().next().and_then(|(_, exit)| exit))
    }

    /// Stop every agent of a project. Returns each agent's exit, if observed.
    pub async fn unregister_all(&self, project_id: &str) -> Vec<(String, Option<ExitInfo>)> {
        let handles = self.list_for_project(project_id).await;
        if handles.is_empty() {
            return Vec::new();
        }
        info!(project_id, count = handles.len(), "Terminating agents");
        self.terminate(handles).await
    }

    async fn terminate(&self, handles: Vec<Arc<AgentHandle>>) -> Vec<(String, Option<ExitInfo>)> {
        for handle in &handles {
            handle.mark_stopping();
            if handle.is_alive()
                && let Some(pid) = handle.pid()
                && let Err(e) = signal::send_terminate(pid)
            {
                warn!(key = %handle.key(), pid, error = %e, "Failed to send SIGTERM");
            }
        }

        let deadline = Instant::now() + self.terminate_timeout;
        let mut exits = Vec::with_capacity(handles.len());

        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut exit = handle.wait_exit(remaining).await;

            if exit.is_none() {
                warn!(key = %handle.key(), pid = ?handle.pid(), "Agent ignored SIGTERM, killing");
                handle.request_kill();
                exit = handle.wait_exit(KILL_WAIT).await;
            }

            handle.cancel_drain();
            if let Some(mut task) = handle.take_drain_task().await
                && tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut task)
                    .await
                    .is_err()
            {
                warn!(key = %handle.key(), "Drain worker did not finish, aborting");
                task.abort();
            }

            self.remove_if_instance(handle.key(), handle.instance()).await;
            info!(key = %handle.key(), exit_code = ?exit.and_then(|e| e.code), "Agent stopped");
            exits.push((handle.agent().to_string(), exit));
        }

        exits
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::process::handle::AgentControl;
    use std::path::PathBuf;

    fn handle(project: &str, agent: &str) -> (Arc<AgentHandle>, AgentControl) {
        let (handle, control) = AgentHandle::new(
            AgentKey::new(project, agent),
            1,
            None,
            None,
            PathBuf::from("/dev/null"),
        );
        (Arc::new(handle), control)
    }

    fn exited() -> Option<ExitInfo> {
        Some(ExitInfo {
            code: Some(0),
            success: true,
        })
    }

    #[tokio::test]
    async fn double_registration_of_live_agent_fails() {
        let registry = ProcessRegistry::new(Duration::from_millis(50));
        let (first, _c1) = handle("p1", "alpha");
        let (second, _c2) = handle("p1", "alpha");

        registry.register(first).await.unwrap();
        let err = registry.register(second).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn dead_leftover_is_replaced() {
        let registry = ProcessRegistry::new(Duration::from_millis(50));
        let (first, c1) = handle("p1", "alpha");
        registry.register(first).await.unwrap();
        c1.exit_tx.send_replace(exited());

        let (second, _c2) = handle("p1", "alpha");
        let instance = second.instance();
        registry.register(second).await.unwrap();
        assert_eq!(
            registry.lookup("p1", "alpha").await.unwrap().instance(),
            instance
        );
    }

    #[tokio::test]
    async fn listing_is_scoped_and_sorted() {
        let registry = ProcessRegistry::new(Duration::from_millis(50));
        let mut controls = Vec::new();
        for (project, agent) in [("p1", "zeta"), ("p1", "alpha"), ("p2", "beta")] {
            let (h, c) = handle(project, agent);
            registry.register(h).await.unwrap();
            controls.push(c);
        }

        let names: Vec<_> = registry
            .list_for_project("p1")
            .await
            .iter()
            .map(|h| h.agent().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.list_for_project("p2").await.len(), 1);
        assert!(!registry.has_active("p3").await);
    }

    #[tokio::test]
    async fn remove_if_instance_ignores_replacements() {
        let registry = ProcessRegistry::new(Duration::from_millis(50));
        let (first, c1) = handle("p1", "alpha");
        let old_instance = first.instance();
        registry.register(first).await.unwrap();
        c1.exit_tx.send_replace(exited());

        let (second, _c2) = handle("p1", "alpha");
        registry.register(second).await.unwrap();

        let key = AgentKey::new("p1", "alpha");
        assert!(!registry.remove_if_instance(&key, old_instance).await);
        assert!(registry.has_active("p1").await);
    }

    #[tokio::test]
    async fn unregister_escalates_to_kill() {
        let registry = ProcessRegistry::new(Duration::from_millis(20));
        let (h, mut control) = handle("p1", "alpha");
        registry.register(h).await.unwrap();

        // Stand-in reaper: exits only once a kill is requested.
        let reaper = tokio::spawn(async move {
            control.kill_rx.changed().await.unwrap();
            control.exit_tx.send_replace(Some(ExitInfo {
                code: None,
                success: false,
            }));
        });

        let exit = registry.unregister("p1", "alpha").await.unwrap();
        assert_eq!(exit.map(|e| e.success), Some(false));
        assert!(!registry.has_active("p1").await);
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn unregister_unknown_agent_is_not_found() {
        let registry = ProcessRegistry::new(Duration::from_millis(20));
        assert!(matches!(
            registry.unregister("p1", "ghost").await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.unregister_all("p1").await.is_empty());
    }
}
