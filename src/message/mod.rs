//! Newline-delimited JSON records for discussion logs.
//!
//! Every record is one JSON object on one line. Readers drop malformed
//! lines silently (a torn trailing write is indistinguishable from noise),
//! and records with an unrecognized `type` are kept in memory but excluded
//! from all decision logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sender name used for user-authored records.
pub const USER_SENDER: &str = "user";

/// Context key carrying the working directory for agent invocations.
pub const CONTEXT_WORKING_DIR: &str = "workingDir";

/// One record in a discussion log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly increasing within a discussion; assigned at append time.
    pub seq: u64,
    /// Stamped at append time.
    pub ts: DateTime<Utc>,
    /// `user` or an agent name.
    pub from: String,
    #[serde(flatten)]
    pub body: Body,
}

/// Type-specific payload, tagged by the `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Body {
    Start {
        topic: String,
        participants: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        context: BTreeMap<String, Value>,
    },
    Response {
        round: u32,
        opinion: Opinion,
        content: String,
        confidence: f64,
    },
    Followup {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    End {
        decision: String,
        consensus: bool,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
    },
    Status {
        status: StatusKind,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
    },
    /// Fallback for records written by newer peers. Holds the raw payload
    /// (everything but the envelope fields) and round-trips verbatim via
    /// the explicit paths in `parse_line` / `to_line`.
    #[serde(skip)]
    Unknown(Value),
}

/// Minimal schema every record must satisfy regardless of its type.
#[derive(Deserialize)]
struct Envelope {
    seq: u64,
    ts: DateTime<Utc>,
    from: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opinion {
    Agree,
    Disagree,
    Neutral,
    Alternative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Thinking,
    Retrying,
}

impl Message {
    /// Parse one log line. Blank and malformed lines yield `None`; a line
    /// with a sound envelope but an unrecognized (or half-formed) payload
    /// is preserved as `Body::Unknown`.
    pub fn parse_line(line: &str) -> Option<Message> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Ok(message) = serde_json::from_str::<Message>(line) {
            return Some(message);
        }

        let value: Value = serde_json::from_str(line).ok()?;
        let envelope: Envelope = serde_json::from_value(value.clone()).ok()?;
        value.get("type")?.as_str()?;
        let mut payload = value.as_object()?.clone();
        payload.remove("seq");
        payload.remove("ts");
        payload.remove("from");
        Some(Message {
            seq: envelope.seq,
            ts: envelope.ts,
            from: envelope.from,
            body: Body::Unknown(Value::Object(payload)),
        })
    }

    /// Serialize to a single line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        if let Body::Unknown(value) = &self.body {
            let mut object = value.as_object().cloned().unwrap_or_default();
            object.insert("seq".to_string(), Value::from(self.seq));
            object.insert(
                "ts".to_string(),
                Value::String(self.ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            );
            object.insert("from".to_string(), Value::String(self.from.clone()));
            return serde_json::to_string(&Value::Object(object));
        }
        serde_json::to_string(self)
    }

    pub fn round(&self) -> Option<u32> {
        match &self.body {
            Body::Response { round, .. } => Some(*round),
            Body::Followup { round, .. } | Body::Error { round, .. } | Body::Status { round, .. } => {
                *round
            }
            _ => None,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.body, Body::Start { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.body, Body::Response { .. })
    }

    pub fn is_end(&self) -> bool {
        matches!(self.body, Body::End { .. })
    }

    /// Wire name of the record type, for rendering and logs.
    pub fn type_name(&self) -> &'static str {
        match &self.body {
            Body::Start { .. } => "start",
            Body::Response { .. } => "response",
            Body::Followup { .. } => "followup",
            Body::End { .. } => "end",
            Body::Error { .. } => "error",
            Body::Status { .. } => "status",
            Body::Unknown(_) => "unknown",
        }
    }
}

/// Parse a full log body into messages, dropping unparseable lines.
pub fn parse_all(text: &str) -> Vec<Message> {
    text.lines().filter_map(Message::parse_line).collect()
}

/// The reader-visible prefix: everything up to and including the first
/// `end` record. Records after an `end` are ignored by all consumers.
pub fn effective(messages: &[Message]) -> &[Message] {
    match messages.iter().position(Message::is_end) {
        Some(idx) => &messages[..=idx],
        None => messages,
    }
}

/// Highest round among `response` records, 0 when none exist.
pub fn highest_response_round(messages: &[Message]) -> u32 {
    messages
        .iter()
        .filter(|m| m.is_response())
        .filter_map(Message::round)
        .max()
        .unwrap_or(0)
}
