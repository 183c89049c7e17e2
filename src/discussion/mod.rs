//! Append-only discussion logs shared across cooperating processes.
//!
//! Each discussion is one `<id>.jsonl` file under the base directory plus
//! a sibling `<id>.jsonl.lock`. The lock is held for the whole
//! read-modify-append sequence so sequence numbers stay unique and ordered
//! across processes; it is never held across a child-process invocation.

mod lock;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::LogConfig;
use crate::error::{ParleyError, Result};
use crate::message::{self, Body, Message, Opinion, StatusKind, USER_SENDER};

pub use lock::{LockInfo, LockOptions, LogLock};

const LOG_EXT: &str = "jsonl";
const ID_SPACE: i64 = 100_000_000;

/// Handle to the shared discussion store.
#[derive(Debug, Clone)]
pub struct DiscussionLog {
    base_dir: PathBuf,
    lock_opts: LockOptions,
}

impl DiscussionLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_opts: LockOptions::default(),
        }
    }

    pub fn with_config(base_dir: impl Into<PathBuf>, config: &LogConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_opts: LockOptions::from(&config.lock),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the base directory and probe it for writability. Called at
    /// daemon startup; failure there is fatal.
    pub async fn ensure_base_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|_| ParleyError::BaseDirUnwritable(self.base_dir.clone()))?;
        let probe = self.base_dir.join(format!(".probe-{}", std::process::id()));
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|_| ParleyError::BaseDirUnwritable(self.base_dir.clone()))?;
        let _ = tokio::fs::remove_file(&probe).await;
        Ok(())
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.{LOG_EXT}"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.{LOG_EXT}.lock"))
    }

    /// Start a discussion: generate an id and write the sole `start`
    /// record with `seq = 1`, failing if the file already exists.
    pub async fn create(
        &self,
        topic: &str,
        participants: Vec<String>,
        context: BTreeMap<String, Value>,
    ) -> Result<(String, Message)> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let start = Message {
            seq: 1,
            ts: Utc::now(),
            from: USER_SENDER.to_string(),
            body: Body::Start {
                topic: topic.to_string(),
                participants,
                context,
            },
        };
        let line = format!("{}\n", start.to_line()?);

        let base = Utc::now().timestamp_millis();
        for offset in 0..8 {
            let id = format!("{}", (base + offset).rem_euclid(ID_SPACE));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.log_path(&id))
                .await
            {
                Ok(mut file) => {
                    file.write_all(line.as_bytes()).await?;
                    debug!(discussion = %id, topic, "Discussion created");
                    return Ok((id, start));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ParleyError::DiscussionExists(format!("{base}")))
    }

    /// Append one record under the cross-process lock: read the log,
    /// assign `seq = lastSeq + 1`, stamp the timestamp (and the round of
    /// an unrounded `followup`), then write the serialized line in a
    /// single append write.
    pub async fn append(&self, id: &str, from: &str, body: Body) -> Result<Message> {
        let lock = LogLock::acquire(&self.lock_path(id), &self.lock_opts).await?;

        let text = self.read_text(id).await?;
        let messages = message::parse_all(&text);
        let last_seq = messages.last().map(|m| m.seq).unwrap_or(0);

        let body = match body {
            Body::Followup {
                content,
                round: None,
                target,
            } => Body::Followup {
                content,
                round: Some(message::highest_response_round(&messages) + 1),
                target,
            },
            other => other,
        };

        let stamped = Message {
            seq: last_seq + 1,
            ts: Utc::now(),
            from: from.to_string(),
            body,
        };

        // A torn previous write leaves the file without a trailing newline;
        // starting on a fresh line keeps later records parseable.
        let lead = if text.is_empty() || text.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        let line = format!("{lead}{}\n", stamped.to_line()?);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))
            .await?;
        file.write_all(line.as_bytes()).await?;

        lock.release();
        debug!(discussion = %id, seq = stamped.seq, kind = stamped.type_name(), "Appended");
        Ok(stamped)
    }

    /// Read and parse the whole log. A missing file is an empty
    /// discussion, not an error; torn or malformed lines drop silently.
    pub async fn read_all(&self, id: &str) -> Result<Vec<Message>> {
        Ok(message::parse_all(&self.read_text(id).await?))
    }

    async fn read_text(&self, id: &str) -> Result<String> {
        match tokio::fs::read_to_string(self.log_path(id)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Derived summary of one discussion.
    pub async fn status(&self, id: &str) -> Result<DiscussionStatus> {
        let messages = self.read_all(id).await?;
        if messages.is_empty()
            && !tokio::fs::try_exists(self.log_path(id)).await.unwrap_or(false)
        {
            return Err(ParleyError::DiscussionNotFound(id.to_string()));
        }
        Ok(DiscussionStatus::derive(id, &messages))
    }

    /// All discussion ids in the base directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXT)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Ids of discussions without an `end` record.
    pub async fn list_active(&self) -> Result<Vec<String>> {
        let mut active = Vec::new();
        for id in self.list().await? {
            match self.status(&id).await {
                Ok(status) if !status.ended => active.push(id),
                Ok(_) => {}
                Err(e) => warn!(discussion = %id, error = %e, "Skipping unreadable discussion"),
            }
        }
        Ok(active)
    }

    /// Poll the log at `interval`; when the tail grows, deliver the new
    /// slice to `callback`. Stop via the returned handle.
    pub fn watch<F>(&self, id: &str, interval: Duration, mut callback: F) -> WatchHandle
    where
        F: FnMut(&[Message]) + Send + 'static,
    {
        let log = self.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut last_seq = 0u64;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let messages = match log.read_all(&id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(discussion = %id, error = %e, "Watch read failed");
                        continue;
                    }
                };
                let newest = messages.last().map(|m| m.seq).unwrap_or(0);
                if newest > last_seq {
                    let tail: Vec<Message> = messages
                        .iter()
                        .filter(|m| m.seq > last_seq)
                        .cloned()
                        .collect();
                    last_seq = newest;
                    callback(&tail);
                }
            }
        });
        WatchHandle { handle }
    }

    // Thin constructors over `append`.

    pub async fn append_response(
        &self,
        id: &str,
        from: &str,
        round: u32,
        opinion: Opinion,
        content: String,
        confidence: f64,
    ) -> Result<Message> {
        self.append(
            id,
            from,
            Body::Response {
                round,
                opinion,
                content,
                confidence,
            },
        )
        .await
    }

    pub async fn append_followup(
        &self,
        id: &str,
        content: String,
        target: Option<String>,
    ) -> Result<Message> {
        self.append(
            id,
            USER_SENDER,
            Body::Followup {
                content,
                round: None,
                target,
            },
        )
        .await
    }

    pub async fn append_end(&self, id: &str, decision: String, consensus: bool) -> Result<Message> {
        self.append(id, USER_SENDER, Body::End { decision, consensus })
            .await
    }

    pub async fn append_error(
        &self,
        id: &str,
        from: &str,
        error: String,
        round: Option<u32>,
    ) -> Result<Message> {
        self.append(id, from, Body::Error { error, round }).await
    }

    pub async fn append_status(
        &self,
        id: &str,
        from: &str,
        status: StatusKind,
        content: String,
        round: Option<u32>,
    ) -> Result<Message> {
        self.append(
            id,
            from,
            Body::Status {
                status,
                content,
                round,
            },
        )
        .await
    }
}

/// Abortable polling watcher.
#[derive(Debug)]
pub struct WatchHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Summary derived from the message sequence; nothing here is stored.
#[derive(Debug, Clone)]
pub struct DiscussionStatus {
    pub id: String,
    pub topic: String,
    pub participants: Vec<String>,
    pub context: BTreeMap<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_round: u32,
    pub ended: bool,
    pub decision: Option<String>,
    pub consensus: Option<bool>,
    pub message_count: usize,
    pub last_seq: u64,
}

impl DiscussionStatus {
    pub fn derive(id: &str, messages: &[Message]) -> Self {
        let eff = message::effective(messages);

        let mut status = Self {
            id: id.to_string(),
            topic: String::new(),
            participants: Vec::new(),
            context: BTreeMap::new(),
            started_at: None,
            ended_at: None,
            current_round: message::highest_response_round(eff),
            ended: false,
            decision: None,
            consensus: None,
            message_count: eff.len(),
            last_seq: eff.last().map(|m| m.seq).unwrap_or(0),
        };

        if let Some(start) = eff.iter().find(|m| m.is_start())
            && let Body::Start {
                topic,
                participants,
                context,
            } = &start.body
        {
            status.topic = topic.clone();
            status.participants = participants.clone();
            status.context = context.clone();
            status.started_at = Some(start.ts);
        }

        if let Some(end) = eff.iter().find(|m| m.is_end())
            && let Body::End {
                decision,
                consensus,
            } = &end.body
        {
            status.ended = true;
            status.ended_at = Some(end.ts);
            status.decision = Some(decision.clone());
            status.consensus = Some(*consensus);
        }

        status
    }

    /// Working directory from the start context, when present.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.context
            .get(crate::message::CONTEXT_WORKING_DIR)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }
}
