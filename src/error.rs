use std::path::PathBuf;

use thiserror::Error;

use crate::invoker::InvokeError;
use crate::reply::ReplyError;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Discussion not found: {0}")]
    DiscussionNotFound(String),

    #[error("Discussion already exists: {0}")]
    DiscussionExists(String),

    #[error("Lock acquisition timed out: {}", path.display())]
    LockTimeout { path: PathBuf },

    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Base directory not writable: {}", .0.display())]
    BaseDirUnwritable(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invocation failed: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Invalid reply: {0}")]
    Reply(#[from] ReplyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// Lock timeouts resolve themselves on a later poll; everything else
    /// that reaches the log is recorded as an `error` message.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

/// Flow-control outcomes of turn admission. These are expected states,
/// not failures; they are logged at debug level and never surface to the
/// discussion log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A response for this discussion is already in flight.
    AlreadyResponding,
    /// This round was already attempted during this process lifetime.
    AlreadyAttempted,
    /// Capacity was exhausted; the candidate sits in the pending queue.
    Queued,
    /// The per-discussion circuit breaker is open.
    CircuitOpen,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AlreadyResponding => "ALREADY_RESPONDING",
            Self::AlreadyAttempted => "ALREADY_ATTEMPTED",
            Self::Queued => "QUEUED",
            Self::CircuitOpen => "LOCAL_CIRCUIT_OPEN",
        };
        f.write_str(s)
    }
}
