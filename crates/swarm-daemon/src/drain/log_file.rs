//! Size-rotated per-agent log file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Append-only log that rotates `agent.log` to `agent.log.1` (shifting older
/// backups up) once it would grow past `max_bytes`.
#[derive(Debug)]
pub struct RotatingLog {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    max_bytes: u64,
    backups: u32,
    /// A write failed; the file is reopened before the next line.
    stale: bool,
}

impl RotatingLog {
    /// Open (or create) the log, appending to existing content.
    ///
    /// `max_bytes == 0` disables rotation. At least one backup is kept.
    pub async fn open(path: PathBuf, max_bytes: u64, backups: u32) -> std::io::Result<Self> {
        let (file, written) = open_append(&path).await?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written,
            max_bytes,
            backups: backups.max(1),
            stale: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a trailing newline is added).
    ///
    /// After a failed write the next call reopens the file first; lines
    /// buffered at the time of the failure are lost.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.stale {
            self.reopen().await?;
        }
        let result = self.append(line).await;
        self.stale = result.is_err();
        result
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            self.rotate().await?;
        }

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.written += len;
        Ok(())
    }

    async fn reopen(&mut self) -> std::io::Result<()> {
        let (file, written) = open_append(&self.path).await?;
        self.writer = BufWriter::new(file);
        self.written = written;
        self.stale = false;
        debug!(path = %self.path.display(), "Reopened agent log");
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;

        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if fs::try_exists(&from).await? {
                fs::rename(&from, self.backup_path(n + 1)).await?;
            }
        }
        fs::rename(&self.path, self.backup_path(1)).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        self.writer = BufWriter::new(file);
        self.written = 0;

        debug!(path = %self.path.display(), "Rotated agent log");
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}
