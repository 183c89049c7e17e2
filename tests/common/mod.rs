//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use parley::agent::AgentBackend;
use parley::discussion::DiscussionLog;
use parley::invoker::InvokeError;
use parley::message::Message;

/// Scripted stand-in for a CLI backend. Pops queued replies in order and
/// falls back to a well-formed agreeing reply when the script runs dry.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<ScriptItem>>,
    calls: AtomicUsize,
}

pub enum ScriptItem {
    Reply(String),
    Timeout,
    Fail(String),
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, item: ScriptItem) {
        self.script.lock().push_back(item);
    }

    pub fn push_reply(&self, body: &str) {
        self.push(ScriptItem::Reply(format!("AGENT:{}\n{body}", self.name)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn default_reply(&self) -> String {
        format!("AGENT:{}\n同意这个方案。\nconfidence: 0.9", self.name)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(
        &self,
        _prompt: &str,
        _working_dir: Option<&Path>,
    ) -> Result<String, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            None => Ok(self.default_reply()),
            Some(ScriptItem::Reply(text)) => Ok(text),
            Some(ScriptItem::Timeout) => Err(InvokeError::Timeout(Duration::from_millis(1))),
            Some(ScriptItem::Fail(message)) => Err(InvokeError::Failed(message)),
        }
    }
}

/// Poll the log until the predicate holds or the deadline passes.
pub async fn wait_for_messages(
    log: &DiscussionLog,
    id: &str,
    deadline: Duration,
    pred: impl Fn(&[Message]) -> bool,
) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if let Ok(messages) = log.read_all(id).await {
            if pred(&messages) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Count responses from one sender in one round.
pub fn responses_in_round(messages: &[Message], from: &str, round: u32) -> usize {
    messages
        .iter()
        .filter(|m| m.is_response() && m.from == from && m.round() == Some(round))
        .count()
}
