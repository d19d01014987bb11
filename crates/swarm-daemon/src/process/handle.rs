//! In-memory handle for one live agent process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Registry key: one agent within one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentKey {
    pub project_id: String,
    pub agent: String,
}

impl AgentKey {
    pub fn new(project_id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            agent: agent.into(),
        }
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.agent)
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Point-in-time view of an agent, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub started_at: i64,
    pub last_output_at: Option<i64>,
    pub line_count: u64,
    pub exit: Option<ExitInfo>,
}

/// Channel ends held by the tasks that own the child process.
pub struct AgentControl {
    pub exit_tx: watch::Sender<Option<ExitInfo>>,
    pub kill_rx: watch::Receiver<bool>,
    pub cancel_rx: watch::Receiver<bool>,
}

/// Tracking state for one agent process.
///
/// The child itself is owned by the drain engine's reaper task; the handle
/// talks to it through watch channels so it never has to be locked while a
/// process is being waited on.
#[derive(Debug)]
pub struct AgentHandle {
    key: AgentKey,
    instance: Uuid,
    run_id: i64,
    pid: Option<u32>,
    started_at: i64,
    last_output_at: AtomicI64,
    line_count: AtomicU64,
    stopping: AtomicBool,
    stdin: Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    log_path: PathBuf,
}

impl AgentHandle {
    pub fn new(
        key: AgentKey,
        run_id: i64,
        pid: Option<u32>,
        stdin: Option<ChildStdin>,
        log_path: PathBuf,
    ) -> (Self, AgentControl) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = Self {
            key,
            instance: Uuid::new_v4(),
            run_id,
            pid,
            started_at: swarm_core::db::unix_timestamp(),
            last_output_at: AtomicI64::new(0),
            line_count: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            stdin: Mutex::new(stdin),
            exit_rx,
            kill_tx,
            cancel_tx,
            drain_task: Mutex::new(None),
            log_path,
        };
        let control = AgentControl {
            exit_tx,
            kill_rx,
            cancel_rx,
        };
        (handle, control)
    }

    pub const fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn agent(&self) -> &str {
        &self.key.agent
    }

    /// Distinguishes successive processes registered under the same key.
    pub const fn instance(&self) -> Uuid {
        self.instance
    }

    pub const fn run_id(&self) -> i64 {
        self.run_id
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Record one line of output read at `now`.
    pub fn record_line(&self, now: i64) {
        self.last_output_at.store(now, Ordering::Relaxed);
        self.line_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_output_at(&self) -> Option<i64> {
        match self.last_output_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn line_count(&self) -> u64 {
        self.line_count.load(Ordering::Relaxed)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Mark the coming exit as requested, so it is not counted as a crash.
    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Ask the reaper to SIGKILL the process.
    pub fn request_kill(&self) {
        self.kill_tx.send_replace(true);
    }

    /// Ask the drain worker to stop reading and flush.
    pub fn cancel_drain(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub async fn set_drain_task(&self, task: JoinHandle<()>) {
        *self.drain_task.lock().await = Some(task);
    }

    pub async fn take_drain_task(&self) -> Option<JoinHandle<()>> {
        self.drain_task.lock().await.take()
    }

    /// Wait for the process to exit. `None` if the reaper went away first.
    pub async fn exited(&self) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.exited())
            .await
            .ok()
            .flatten()
    }

    /// Write one line to the agent's stdin.
    ///
    /// A broken pipe is reported to the caller; the process is left alone.
    pub async fn write_stdin(&self, text: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is closed")
        })?;

        stdin.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let exit = self.exit_info();
        AgentSnapshot {
            agent: self.key.agent.clone(),
            pid: self.pid,
            alive: exit.is_none(),
            started_at: self.started_at,
            last_output_at: self.last_output_at(),
            line_count: self.line_count(),
            exit,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn handle() -> (AgentHandle, AgentControl) {
        AgentHandle::new(
            AgentKey::new("p1", "alpha"),
            1,
            Some(4242),
            None,
            PathBuf::from("/tmp/alpha.log"),
        )
    }

    #[tokio::test]
    async fn exit_is_observed_through_watch() {
        let (handle, control) = handle();
        assert!(handle.is_alive());
        assert!(handle.wait_exit(Duration::from_millis(10)).await.is_none());

        control.exit_tx.send_replace(Some(ExitInfo {
            code: Some(0),
            success: true,
        }));
        let exit = handle.wait_exit(Duration::from_millis(10)).await.unwrap();
        assert!(exit.success);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn kill_and_cancel_reach_control() {
        let (handle, mut control) = handle();
        handle.request_kill();
        handle.cancel_drain();
        control.kill_rx.changed().await.unwrap();
        assert!(*control.kill_rx.borrow());
        assert!(*control.cancel_rx.borrow_and_update());
    }

    #[test]
    fn line_accounting() {
        let (handle, _control) = handle();
        assert_eq!(handle.last_output_at(), None);
        handle.record_line(100);
        handle.record_line(105);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.line_count, 2);
        assert_eq!(snapshot.last_output_at, Some(105));
        assert!(snapshot.alive);
    }

    #[tokio::test]
    async fn writing_without_stdin_is_broken_pipe() {
        let (handle, _control) = handle();
        let err = handle.write_stdin("hello").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
