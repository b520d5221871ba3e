//! Server control FIFO
//!
//! `indiserver -f <fifo>` reads one driver command per line from a named
//! pipe. Writes are fire-and-forget: the server never acknowledges them.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;

/// Interval between attempts to open a FIFO nobody reads yet
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Destination of driver start/stop commands
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Replace any stale channel with a fresh, empty one
    async fn recreate(&self) -> ServerResult<()>;

    /// Deliver one command line (without trailing newline)
    async fn send(&self, command: &str) -> ServerResult<()>;
}

/// Named pipe at a fixed path
#[derive(Debug, Clone)]
pub struct FifoChannel {
    path: PathBuf,
    open_timeout: Duration,
}

impl FifoChannel {
    pub fn new(path: impl Into<PathBuf>, open_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            open_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, reason: impl ToString) -> ServerError {
        ServerError::FifoUnavailable {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    async fn open_sender(&self) -> ServerResult<pipe::Sender> {
        let deadline = tokio::time::Instant::now() + self.open_timeout;
        loop {
            match pipe::OpenOptions::new().open_sender(&self.path) {
                Ok(sender) => return Ok(sender),
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(self.unavailable("no reader on the FIFO"));
                    }
                    tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(self.unavailable(e)),
            }
        }
    }
}

#[async_trait]
impl CommandSink for FifoChannel {
    async fn recreate(&self) -> ServerResult<()> {
        tracing::info!("Deleting fifo {}", self.path.display());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH)
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn send(&self, command: &str) -> ServerResult<()> {
        tracing::info!("FIFO <- {}", command);
        let mut sender = self.open_sender().await?;
        let mut line = command.to_string();
        line.push('\n');
        sender
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }
}
