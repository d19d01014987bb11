//! Per-agent drain worker.
//!
//! Each attached agent gets three tasks: a reaper that owns the child and
//! publishes its exit status, one reader per output pipe, and a worker that
//! consumes lines in arrival order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use swarm_core::config::SupervisorSettings;
use swarm_core::db::unix_timestamp;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::log_file::RotatingLog;
use super::markers;
use crate::checkpoint::CheckpointBatcher;
use crate::output::{OutputLine, OutputSinks, OutputStore, StreamKind};
use crate::process::{AgentControl, AgentHandle, AgentKey, ExitInfo, ProcessRegistry};

/// Lines buffered between the pipe readers and the worker.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Reported to the run's supervisor loop when a drain worker finishes.
#[derive(Debug, Clone)]
pub struct AgentExit {
    pub agent: String,
    pub instance: Uuid,
    pub exit: Option<ExitInfo>,
    /// The exit was requested (stop or restart) rather than spontaneous.
    pub expected: bool,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.exit.is_some_and(|e| e.success)
    }
}

/// Run-scoped context for a drain worker.
#[derive(Debug, Clone)]
pub struct DrainContext {
    pub project_id: String,
    pub run_id: i64,
    pub exit_tx: mpsc::UnboundedSender<AgentExit>,
}

/// Pipes of a spawned child handed to [`DrainEngine::attach`].
pub struct DrainPipes<O, E> {
    pub child: Child,
    pub stdout: O,
    pub stderr: E,
}

/// Attaches drain workers to spawned agents.
pub struct DrainEngine {
    registry: Arc<ProcessRegistry>,
    output: Arc<OutputStore>,
    batcher: Arc<CheckpointBatcher>,
    log_dir_name: PathBuf,
    log_max_bytes: u64,
    log_backups: u32,
}

impl DrainEngine {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        output: Arc<OutputStore>,
        batcher: Arc<CheckpointBatcher>,
        settings: &SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            output,
            batcher,
            log_dir_name: settings.log_dir_name.clone(),
            log_max_bytes: settings.log_max_bytes,
            log_backups: settings.log_backups,
        }
    }

    /// Log file of an agent under a project root.
    pub fn log_path(&self, project_root: &Path, agent: &str) -> PathBuf {
        project_root
            .join(&self.log_dir_name)
            .join(format!("{agent}.log"))
    }

    /// Start draining a registered agent.
    pub async fn attach<O, E>(
        &self,
        handle: &Arc<AgentHandle>,
        control: AgentControl,
        pipes: DrainPipes<O, E>,
        ctx: DrainContext,
    ) where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let AgentControl {
            exit_tx,
            kill_rx,
            cancel_rx,
        } = control;
        let key = handle.key().clone();

        spawn_reaper(pipes.child, kill_rx, exit_tx, key.clone());

        let log = match RotatingLog::open(
            handle.log_path().to_path_buf(),
            self.log_max_bytes,
            self.log_backups,
        )
        .await
        {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(%key, path = %handle.log_path().display(), error = %e, "Agent log unavailable");
                None
            }
        };

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let readers = [
            spawn_reader(pipes.stdout, StreamKind::Stdout, line_tx.clone(), key.clone()),
            spawn_reader(pipes.stderr, StreamKind::Stderr, line_tx, key.clone()),
        ];

        let worker = Worker {
            handle: Arc::clone(handle),
            registry: Arc::clone(&self.registry),
            sinks: self.output.sinks(&key.project_id, &key.agent).await,
            batcher: Arc::clone(&self.batcher),
            log,
            log_failing: false,
            ctx,
        };
        let task = tokio::spawn(worker.run(line_rx, cancel_rx, readers));
        handle.set_drain_task(task).await;

        debug!(%key, pid = ?handle.pid(), "Drain attached");
    }
}

fn spawn_reaper(
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    key: AgentKey,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx.changed() => {
                if let Err(e) = child.start_kill() {
                    warn!(%key, error = %e, "Failed to kill agent");
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                warn!(%key, error = %e, "Error waiting for agent");
                ExitInfo {
                    code: None,
                    success: false,
                }
            }
        };
        debug!(%key, code = ?exit.code, "Agent process reaped");
        exit_tx.send_replace(Some(exit));
    })
}

/// Read a pipe line by line. Invalid UTF-8 is replaced rather than ending
/// the stream.
fn spawn_reader<R>(
    reader: R,
    stream: StreamKind,
    tx: mpsc::Sender<(StreamKind, String)>,
    key: AgentKey,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%key, stream = stream.as_str(), error = %e, "Pipe read failed");
                    break;
                }
            }
        }
        debug!(%key, stream = stream.as_str(), "Pipe reader finished");
    })
}

struct Worker {
    handle: Arc<AgentHandle>,
    registry: Arc<ProcessRegistry>,
    sinks: OutputSinks,
    batcher: Arc<CheckpointBatcher>,
    log: Option<RotatingLog>,
    log_failing: bool,
    ctx: DrainContext,
}

impl Worker {
    async fn run(
        mut self,
        mut lines: mpsc::Receiver<(StreamKind, String)>,
        mut cancel_rx: watch::Receiver<bool>,
        readers: [JoinHandle<()>; 2],
    ) {
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    cancelled = true;
                    break;
                }
                next = lines.recv() => match next {
                    Some((stream, text)) => self.handle_line(stream, text).await,
                    None => break,
                },
            }
        }

        if cancelled {
            for reader in &readers {
                reader.abort();
            }
            while let Ok((stream, text)) = lines.try_recv() {
                self.handle_line(stream, text).await;
            }
        }

        if let Some(log) = self.log.as_mut()
            && let Err(e) = log.flush().await
        {
            warn!(key = %self.handle.key(), error = %e, "Failed to flush agent log");
        }

        let exit = if cancelled {
            self.handle.exit_info()
        } else {
            // Output is closed; the process is normally about to exit.
            tokio::select! {
                exit = self.handle.exited() => exit,
                _ = cancel_rx.changed() => self.handle.exit_info(),
            }
        };

        let key = self.handle.key().clone();
        self.registry
            .remove_if_instance(&key, self.handle.instance())
            .await;

        let expected = self.handle.is_stopping();
        info!(
            %key,
            run_id = self.ctx.run_id,
            exit_code = ?exit.and_then(|e| e.code),
            lines = self.handle.line_count(),
            expected,
            "Agent drain finished"
        );

        // The supervisor loop may already be gone after a stop.
        let _ = self.ctx.exit_tx.send(AgentExit {
            agent: key.agent,
            instance: self.handle.instance(),
            exit,
            expected,
        });
    }

    async fn handle_line(&mut self, stream: StreamKind, text: String) {
        let now = unix_timestamp();
        self.handle.record_line(now);

        if let Some(log) = self.log.as_mut() {
            let result = match stream {
                StreamKind::Stdout => log.write_line(&text).await,
                StreamKind::Stderr => log.write_line(&format!("[stderr] {text}")).await,
            };
            match result {
                Err(e) if !self.log_failing => {
                    warn!(
                        key = %self.handle.key(),
                        path = %log.path().display(),
                        error = %e,
                        "Agent log write failed, reopening on next line"
                    );
                    self.log_failing = true;
                }
                Ok(()) if self.log_failing => {
                    info!(key = %self.handle.key(), "Agent log recovered");
                    self.log_failing = false;
                }
                _ => {}
            }
        }

        if let Some(marker) = markers::detect(&text) {
            self.batcher
                .record(
                    &self.ctx.project_id,
                    self.ctx.run_id,
                    self.handle.agent(),
                    marker.checkpoint_type,
                    &marker.data,
                )
                .await;
        }

        self.sinks
            .push(OutputLine {
                agent: self.handle.agent().to_string(),
                stream,
                text,
                timestamp: now,
            })
            .await;
    }
}
