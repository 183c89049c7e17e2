//! Cross-process lock file guarding log appends.
//!
//! Presence of `<id>.jsonl.lock` means held; absence means released. The
//! payload is `<pid>:<epoch-ms>` for diagnostic inspection only; staleness
//! is judged from the file's mtime so a crashed writer cannot block the
//! log forever.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{ParleyError, Result};

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub poll: Duration,
    pub stale: Duration,
    pub deadline: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            poll: Duration::from_millis(config.poll_ms),
            stale: Duration::from_millis(config.stale_ms),
            deadline: Duration::from_millis(config.deadline_ms),
        }
    }
}

/// Parsed lock payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub epoch_ms: i64,
}

impl LockInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            epoch_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}:{}", self.pid, self.epoch_ms)
    }

    pub fn parse(content: &str) -> Option<Self> {
        let (pid, epoch_ms) = content.trim().split_once(':')?;
        Some(Self {
            pid: pid.parse().ok()?,
            epoch_ms: epoch_ms.parse().ok()?,
        })
    }
}

/// Held lock. Dropping releases it; release failures are ignored because
/// they mean another party already reclaimed the file.
#[derive(Debug)]
pub struct LogLock {
    path: PathBuf,
}

impl LogLock {
    /// Acquire with create-exclusive semantics, polling while another
    /// writer holds the file and reclaiming stale locks by mtime.
    pub async fn acquire(path: &Path, opts: &LockOptions) -> Result<LogLock> {
        let deadline = Instant::now() + opts.deadline;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let _ = file
                        .write_all(LockInfo::current().render().as_bytes())
                        .await;
                    return Ok(LogLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(path, opts.stale).await {
                        warn!(path = %path.display(), "Reclaiming stale lock");
                        let _ = tokio::fs::remove_file(path).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(ParleyError::LockTimeout {
                            path: path.to_path_buf(),
                        });
                    }
                    tokio::time::sleep(opts.poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release; equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for LogLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %self.path.display(), error = %e, "Lock already cleared");
        }
    }
}

async fn is_stale(path: &Path, stale: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        // Vanished between the open attempt and this check.
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale)
        .unwrap_or(false)
}
