//! Batched checkpoint persistence with per-(run, agent, type) cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use swarm_core::config::CheckpointSettings;
use swarm_core::db::unix_timestamp;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{CheckpointError, CheckpointType};
use crate::events::{EventBus, SwarmEvent};
use crate::storage::{Database, NewCheckpoint};

type CooldownKey = (i64, String, CheckpointType);

/// Buffers checkpoint events and writes them in per-run transactions.
///
/// A flush is triggered by the periodic timer or as soon as any run's batch
/// reaches `batch_size`. A failed write puts the batch back for the next
/// attempt.
pub struct CheckpointBatcher {
    db: Database,
    settings: CheckpointSettings,
    events: EventBus,
    pending: Mutex<HashMap<i64, Vec<NewCheckpoint>>>,
    cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
    wake: Notify,
}

impl CheckpointBatcher {
    pub fn new(db: Database, settings: CheckpointSettings, events: EventBus) -> Self {
        Self {
            db,
            settings,
            events,
            pending: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.settings.cooldown_millis)
    }

    /// Queue a checkpoint. Returns `false` if it was suppressed by the
    /// cooldown.
    pub async fn record(
        &self,
        project_id: &str,
        run_id: i64,
        agent: &str,
        checkpoint_type: CheckpointType,
        data: &str,
    ) -> bool {
        let now = Instant::now();
        {
            let mut cooldowns = self.cooldowns.lock().await;
            let key = (run_id, agent.to_string(), checkpoint_type);
            if let Some(last) = cooldowns.get(&key)
                && now.duration_since(*last) < self.cooldown()
            {
                debug!(run_id, agent, %checkpoint_type, "Checkpoint suppressed by cooldown");
                return false;
            }
            cooldowns.insert(key, now);
        }

        let batch_full = {
            let mut pending = self.pending.lock().await;
            let batch = pending.entry(run_id).or_default();
            batch.push(NewCheckpoint {
                project_id: project_id.to_string(),
                run_id,
                agent_name: agent.to_string(),
                checkpoint_type: checkpoint_type.as_str().to_string(),
                data: data.to_string(),
                created_at: unix_timestamp(),
            });
            batch.len() >= self.settings.batch_size.max(1)
        };
        if batch_full {
            self.wake.notify_one();
        }

        self.events.publish(SwarmEvent::Checkpoint {
            project_id: project_id.to_string(),
            run_id,
            agent: agent.to_string(),
            checkpoint_type: checkpoint_type.as_str().to_string(),
            data: data.to_string(),
        });
        true
    }

    /// Events waiting to be written.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.values().map(Vec::len).sum()
    }

    /// Write every pending batch. Batches that fail are kept; the first
    /// error is returned after all runs were attempted.
    pub async fn flush(&self) -> Result<usize, CheckpointError> {
        let batches: Vec<(i64, Vec<NewCheckpoint>)> =
            self.pending.lock().await.drain().collect();

        let mut written = 0;
        let mut first_error = None;
        for (run_id, batch) in batches {
            match self.write_batch(run_id, batch).await {
                Ok(n) => written += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        self.prune_cooldowns().await;

        first_error.map_or(Ok(written), Err)
    }

    /// Write the pending batch of one run.
    pub async fn flush_run(&self, run_id: i64) -> Result<usize, CheckpointError> {
        let batch = self.pending.lock().await.remove(&run_id);
        match batch {
            Some(batch) => self.write_batch(run_id, batch).await,
            None => Ok(0),
        }
    }

    async fn write_batch(
        &self,
        run_id: i64,
        batch: Vec<NewCheckpoint>,
    ) -> Result<usize, CheckpointError> {
        if batch.is_empty() {
            return Ok(0);
        }

        match self.db.insert_checkpoints(&batch).await {
            Ok(_) => {
                debug!(run_id, count = batch.len(), "Flushed checkpoints");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(run_id, count = batch.len(), error = %e, "Checkpoint flush failed, keeping batch");
                let mut pending = self.pending.lock().await;
                let slot = pending.entry(run_id).or_default();
                let newer = std::mem::replace(slot, batch);
                slot.extend(newer);
                Err(e.into())
            }
        }
    }

    async fn prune_cooldowns(&self) {
        let cooldown = self.cooldown();
        let now = Instant::now();
        self.cooldowns
            .lock()
            .await
            .retain(|_, last| now.duration_since(*last) < cooldown);
    }

    /// Drop cooldown state of a closed run.
    pub async fn forget_run(&self, run_id: i64) {
        self.cooldowns
            .lock()
            .await
            .retain(|(run, _, _), _| *run != run_id);
    }

    /// Drop everything queued for a run that was rolled back.
    pub async fn discard_run(&self, run_id: i64) -> usize {
        let dropped = self
            .pending
            .lock()
            .await
            .remove(&run_id)
            .map_or(0, |batch| batch.len());
        self.forget_run(run_id).await;
        if dropped > 0 {
            debug!(run_id, dropped, "Discarded pending checkpoints");
        }
        dropped
    }

    /// Spawn the periodic flush loop. It flushes one last time when
    /// `shutdown` flips to `true`.
    pub fn spawn_flush_task(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        let interval = Duration::from_millis(self.settings.flush_interval_millis.max(1));

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis(), "Checkpoint flush task started");
            loop {
                let stop = tokio::select! {
                    () = tokio::time::sleep(interval) => false,
                    () = batcher.wake.notified() => false,
                    res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
                };

                if let Err(e) = batcher.flush().await {
                    warn!(error = %e, "Periodic checkpoint flush failed");
                }

                if stop {
                    break;
                }
            }
            info!("Checkpoint flush task stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn setup(settings: CheckpointSettings) -> (Arc<CheckpointBatcher>, Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        db.create_project("p1", "P1", "/tmp/p1").await.unwrap();
        let run = db.create_run("p1", &["alpha".to_string()]).await.unwrap();
        let batcher = Arc::new(CheckpointBatcher::new(
            db.clone(),
            settings,
            EventBus::default(),
        ));
        (batcher, db, run.id)
    }

    fn settings(batch_size: usize, cooldown_millis: u64) -> CheckpointSettings {
        CheckpointSettings {
            batch_size,
            flush_interval_millis: 60_000,
            cooldown_millis,
        }
    }

    #[tokio::test]
    async fn cooldown_collapses_duplicates() {
        let (batcher, db, run_id) = setup(settings(50, 60_000)).await;

        assert!(batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "a").await);
        assert!(!batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "b").await);
        // Different type and different agent are separate keys.
        assert!(batcher.record("p1", run_id, "alpha", CheckpointType::Error, "c").await);
        assert!(batcher.record("p1", run_id, "beta", CheckpointType::TaskDone, "d").await);

        assert_eq!(batcher.flush().await.unwrap(), 3);
        let stored = db.list_checkpoints(run_id, Some("alpha")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].data, "a");
    }

    #[tokio::test]
    async fn zero_cooldown_keeps_everything() {
        let (batcher, db, run_id) = setup(settings(50, 0)).await;
        for _ in 0..3 {
            assert!(batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "x").await);
        }
        batcher.flush_run(run_id).await.unwrap();
        assert_eq!(db.get_run(run_id).await.unwrap().tasks_completed, 3);
    }

    #[tokio::test]
    async fn failed_flush_keeps_batch_for_retry() {
        let (batcher, db, run_id) = setup(settings(50, 0)).await;
        batcher.record("p1", run_id, "alpha", CheckpointType::PhaseStart, "2").await;

        sqlx::query("ALTER TABLE checkpoints RENAME TO checkpoints_offline")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.pending_count().await, 1);

        sqlx::query("ALTER TABLE checkpoints_offline RENAME TO checkpoints")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(batcher.flush().await.unwrap(), 1);
        assert_eq!(batcher.pending_count().await, 0);
        assert_eq!(db.get_run(run_id).await.unwrap().phase_number, 2);
    }

    #[tokio::test]
    async fn full_batch_wakes_flush_task() {
        let (batcher, db, run_id) = setup(settings(2, 0)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = batcher.spawn_flush_task(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "1").await;
        batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "2").await;

        let mut flushed = false;
        for _ in 0..50 {
            if db.list_checkpoints(run_id, None).await.unwrap().len() == 2 {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed, "batch should be flushed without waiting for the timer");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn discarded_run_leaves_nothing_behind() {
        let (batcher, db, run_id) = setup(settings(50, 60_000)).await;
        batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "x").await;

        assert_eq!(batcher.discard_run(run_id).await, 1);
        assert_eq!(batcher.pending_count().await, 0);
        assert_eq!(batcher.flush().await.unwrap(), 0);
        assert!(db.list_checkpoints(run_id, None).await.unwrap().is_empty());

        // Cooldown state went with it.
        assert!(batcher.record("p1", run_id, "alpha", CheckpointType::TaskDone, "y").await);
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining() {
        let (batcher, db, run_id) = setup(settings(50, 0)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = batcher.spawn_flush_task(shutdown_rx);

        batcher.record("p1", run_id, "alpha", CheckpointType::Error, "boom").await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(db.list_checkpoints(run_id, None).await.unwrap().len(), 1);
    }
}
