//! End-to-end scenarios driving two agent runtimes over one shared log.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{ScriptedBackend, wait_for_messages};
use parley::config::RuntimeConfig;
use parley::discussion::DiscussionLog;
use parley::message::{Body, Message, Opinion};
use parley::runtime::AgentRuntime;

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval_ms: 100,
        retry_base_delay_ms: 20,
        retry_max_delay_ms: 40,
        ..RuntimeConfig::default()
    }
}

fn runtime(dir: &TempDir, backend: Arc<ScriptedBackend>, config: RuntimeConfig) -> AgentRuntime {
    AgentRuntime::new(backend, DiscussionLog::new(dir.path()), config)
}

async fn create(dir: &TempDir, participants: &[&str]) -> (DiscussionLog, String) {
    let log = DiscussionLog::new(dir.path());
    let (id, _) = log
        .create(
            "Use REST or GraphQL?",
            participants.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    (log, id)
}

fn count_responses(messages: &[Message], from: &str, round: u32) -> usize {
    common::responses_in_round(messages, from, round)
}

fn non_status(messages: &[Message]) -> Vec<&'static str> {
    messages
        .iter()
        .filter(|m| !matches!(m.body, Body::Status { .. }))
        .map(|m| m.type_name())
        .collect()
}

#[tokio::test]
async fn test_happy_path_two_agents_two_rounds() {
    let dir = TempDir::new().unwrap();
    let claude = ScriptedBackend::new("claude");
    let codex = ScriptedBackend::new("codex");
    // Both agents run from the same daemon config but do not share state.
    let claude_rt = runtime(&dir, Arc::clone(&claude), fast_config());
    let codex_rt = runtime(&dir, Arc::clone(&codex), fast_config());

    let (log, id) = create(&dir, &["claude", "codex"]).await;

    // Round 1: both agents pick up the start trigger.
    claude_rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 1) == 1
        })
        .await
    );
    codex_rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "codex", 1) == 1
        })
        .await
    );

    // Both agreed; the closure sentence names the counterpart.
    let messages = log.read_all(&id).await.unwrap();
    for m in messages.iter().filter(|m| m.is_response()) {
        if let Body::Response {
            opinion, content, ..
        } = &m.body
        {
            assert_eq!(*opinion, Opinion::Agree);
            assert!(content.contains("可以结束"));
        }
    }

    // Follow-up opens round 2.
    let followup = log
        .append_followup(&id, "What about caching?".into(), None)
        .await
        .unwrap();
    assert_eq!(followup.round(), Some(2));

    claude.push_reply("缓存可以用CDN，我同意这个方向。");
    codex.push_reply("同意，再加一层应用内缓存。");
    claude_rt.poll_now(&id).await;
    codex_rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 2) == 1 && count_responses(m, "codex", 2) == 1
        })
        .await
    );

    log.append_end(&id, "REST + caching layer".into(), true)
        .await
        .unwrap();

    let status = log.status(&id).await.unwrap();
    assert!(status.ended);
    assert_eq!(status.current_round, 2);
    assert_eq!(status.decision.as_deref(), Some("REST + caching layer"));

    // Exactly one response per agent per round; terminal shape matches.
    let messages = log.read_all(&id).await.unwrap();
    for agent in ["claude", "codex"] {
        for round in 1..=2u32 {
            assert_eq!(count_responses(&messages, agent, round), 1);
        }
    }
    assert_eq!(
        non_status(&messages),
        vec!["start", "response", "response", "followup", "response", "response", "end"]
    );
}

#[tokio::test]
async fn test_targeted_followup_only_reaches_target() {
    let dir = TempDir::new().unwrap();
    let claude = ScriptedBackend::new("claude");
    let codex = ScriptedBackend::new("codex");
    let claude_rt = runtime(&dir, Arc::clone(&claude), fast_config());
    let codex_rt = runtime(&dir, Arc::clone(&codex), fast_config());

    let (log, id) = create(&dir, &["claude", "codex"]).await;

    claude_rt.poll_now(&id).await;
    codex_rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 1) == 1 && count_responses(m, "codex", 1) == 1
        })
        .await
    );
    let codex_calls_before = codex.calls();

    log.append_followup(&id, "claude, your take?".into(), Some("claude".into()))
        .await
        .unwrap();

    claude_rt.poll_now(&id).await;
    codex_rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 2) == 1
        })
        .await
    );

    // The suppressed agent never invoked its CLI again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let messages = log.read_all(&id).await.unwrap();
    assert_eq!(count_responses(&messages, "codex", 2), 0);
    assert_eq!(codex.calls(), codex_calls_before);
}

#[tokio::test]
async fn test_autonomous_rounds_stop_at_cap() {
    let dir = TempDir::new().unwrap();
    let claude = ScriptedBackend::new("claude");
    let config = RuntimeConfig {
        max_rounds: 2,
        ..fast_config()
    };
    let rt = runtime(&dir, Arc::clone(&claude), config);

    let log = DiscussionLog::new(dir.path());
    let (id, _) = log
        .create("solo", vec!["claude".into()], BTreeMap::new())
        .await
        .unwrap();

    rt.start().await.unwrap();

    // The single participant completes each round alone, so the runtime
    // advances on its own until the round cap.
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(10), |m| {
            count_responses(m, "claude", 2) == 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    let messages = log.read_all(&id).await.unwrap();
    assert_eq!(count_responses(&messages, "claude", 1), 1);
    assert_eq!(count_responses(&messages, "claude", 2), 1);
    assert_eq!(count_responses(&messages, "claude", 3), 0);
    rt.stop();
}

#[tokio::test]
async fn test_timeout_recovery_leaves_clean_trace() {
    let dir = TempDir::new().unwrap();
    let claude = ScriptedBackend::new("claude");
    claude.push(common::ScriptItem::Timeout);
    let rt = runtime(&dir, Arc::clone(&claude), fast_config());

    let log = DiscussionLog::new(dir.path());
    let (id, _) = log
        .create("timeouts", vec!["claude".into()], BTreeMap::new())
        .await
        .unwrap();

    rt.poll_now(&id).await;
    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 1) == 1
        })
        .await
    );

    // Trace: thinking, retrying 1/3, (thinking again,) response.
    let messages = log.read_all(&id).await.unwrap();
    let retrying = messages.iter().any(|m| {
        matches!(&m.body, Body::Status { status, content, .. }
            if *status == parley::message::StatusKind::Retrying && content == "1/3")
    });
    assert!(retrying);
    assert_eq!(claude.calls(), 2);
}

#[tokio::test]
async fn test_two_runtimes_never_double_respond_under_races() {
    let dir = TempDir::new().unwrap();
    let claude = ScriptedBackend::new("claude");
    let codex = ScriptedBackend::new("codex");
    let claude_rt = runtime(&dir, Arc::clone(&claude), fast_config());
    let codex_rt = runtime(&dir, Arc::clone(&codex), fast_config());

    let (log, id) = create(&dir, &["claude", "codex"]).await;

    // Hammer both runtimes with overlapping polls.
    for _ in 0..5 {
        tokio::join!(
            claude_rt.poll_now(&id),
            codex_rt.poll_now(&id),
            claude_rt.poll_now(&id),
            codex_rt.poll_now(&id),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(
        wait_for_messages(&log, &id, Duration::from_secs(5), |m| {
            count_responses(m, "claude", 1) >= 1 && count_responses(m, "codex", 1) >= 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let messages = log.read_all(&id).await.unwrap();
    assert_eq!(count_responses(&messages, "claude", 1), 1);
    assert_eq!(count_responses(&messages, "codex", 1), 1);
}
