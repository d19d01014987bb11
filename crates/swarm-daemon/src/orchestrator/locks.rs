//! Per-project mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per project id. Different projects never contend.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of `project_id`, creating it on first use.
    ///
    /// The map lock is released before waiting on the project lock.
    pub async fn lock(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(project_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a project. Holders keep their guard.
    pub async fn remove(&self, project_id: &str) -> bool {
        self.locks.lock().await.remove(project_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_project_is_serialized() {
        let locks = Arc::new(ProjectLocks::new());
        let guard = locks.lock("p1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("p1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_projects_do_not_block() {
        let locks = ProjectLocks::new();
        let _a = locks.lock("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
            .await
            .unwrap();
        assert_eq!(locks.len().await, 2);
        assert!(locks.remove("a").await);
        assert!(!locks.remove("a").await);
    }
}
