//! Discussion log invariants under concurrent writers.

mod common;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tempfile::TempDir;

use parley::discussion::DiscussionLog;
use parley::message::{Body, Message, Opinion, USER_SENDER};

async fn new_discussion(log: &DiscussionLog, participants: &[&str]) -> String {
    let (id, _) = log
        .create(
            "concurrency",
            participants.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_create_then_read_is_single_start() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());

    let (id, start) = log
        .create("topic", vec!["claude".into(), "codex".into()], BTreeMap::new())
        .await
        .unwrap();

    let messages = log.read_all(&id).await.unwrap();
    assert_eq!(messages, vec![start]);
    assert_eq!(messages[0].seq, 1);
}

#[tokio::test]
async fn test_concurrent_appends_keep_seq_dense_and_ordered() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["a", "b", "c", "d"]).await;

    const WRITERS: usize = 4;
    const APPENDS: usize = 10;

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            // Separate handles model separate cooperating writers; only
            // the lock file coordinates them.
            let log = DiscussionLog::new(dir.path());
            let id = id.clone();
            tokio::spawn(async move {
                for i in 0..APPENDS {
                    log.append(
                        &id,
                        &format!("writer-{w}"),
                        Body::Status {
                            status: parley::message::StatusKind::Thinking,
                            content: format!("{w}:{i}"),
                            round: None,
                        },
                    )
                    .await
                    .unwrap();
                }
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let messages = log.read_all(&id).await.unwrap();
    assert_eq!(messages.len(), 1 + WRITERS * APPENDS);

    // Strictly increasing, no gaps, no duplicates.
    let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
    let unique: HashSet<u64> = seqs.iter().copied().collect();
    assert_eq!(unique.len(), seqs.len());
}

#[tokio::test]
async fn test_two_writers_collide_within_same_moment() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude", "codex"]).await;

    let first = DiscussionLog::new(dir.path());
    let second = DiscussionLog::new(dir.path());
    let (id_a, id_b) = (id.clone(), id.clone());

    let (a, b) = tokio::join!(
        first.append_response(&id_a, "claude", 1, Opinion::Agree, "a".into(), 0.8),
        second.append_response(&id_b, "codex", 1, Opinion::Agree, "b".into(), 0.8),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // One acquired the lock first; the other spun and appended next.
    let mut seqs = [a.seq, b.seq];
    seqs.sort_unstable();
    assert_eq!(seqs, [2, 3]);
}

#[tokio::test]
async fn test_followup_rounds_assigned_in_append_order() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude", "codex"]).await;

    log.append_response(&id, "claude", 1, Opinion::Agree, "x".into(), 0.8)
        .await
        .unwrap();
    log.append_response(&id, "codex", 1, Opinion::Agree, "y".into(), 0.8)
        .await
        .unwrap();

    let f1 = log.append_followup(&id, "first".into(), None).await.unwrap();
    assert_eq!(f1.round(), Some(2));

    // Round base is response rounds only, so a second follow-up before
    // any answer lands on the same round.
    let f2 = log.append_followup(&id, "second".into(), None).await.unwrap();
    assert_eq!(f2.round(), Some(2));

    log.append_response(&id, "claude", 2, Opinion::Neutral, "z".into(), 0.7)
        .await
        .unwrap();
    let f3 = log.append_followup(&id, "third".into(), None).await.unwrap();
    assert_eq!(f3.round(), Some(3));
}

#[tokio::test]
async fn test_round_identity_across_log() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude", "codex"]).await;

    for round in 1..=3u32 {
        for agent in ["claude", "codex"] {
            log.append_response(&id, agent, round, Opinion::Neutral, "r".into(), 0.7)
                .await
                .unwrap();
        }
    }

    let messages = log.read_all(&id).await.unwrap();
    for round in 1..=3u32 {
        for agent in ["claude", "codex"] {
            assert_eq!(common::responses_in_round(&messages, agent, round), 1);
        }
    }
}

#[tokio::test]
async fn test_status_frozen_after_end() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude"]).await;

    log.append_end(&id, "decided".into(), true).await.unwrap();
    let before = log.status(&id).await.unwrap();

    log.append_response(&id, "claude", 4, Opinion::Disagree, "late".into(), 0.7)
        .await
        .unwrap();
    log.append_followup(&id, "revive?".into(), None).await.unwrap();

    let after = log.status(&id).await.unwrap();
    assert_eq!(after.ended, before.ended);
    assert_eq!(after.current_round, before.current_round);
    assert_eq!(after.message_count, before.message_count);
    assert_eq!(after.decision, before.decision);
}

#[tokio::test]
async fn test_stale_lock_does_not_block_appends() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude"]).await;

    // A crashed writer left its lock behind with an ancient mtime.
    let lock_path = dir.path().join(format!("{id}.jsonl.lock"));
    std::fs::write(&lock_path, "4242:0").unwrap();
    let old = filetime_like(&lock_path, Duration::from_secs(120));
    assert!(old, "failed to age the lock file");

    let appended = log
        .append_response(&id, "claude", 1, Opinion::Agree, "ok".into(), 0.8)
        .await
        .unwrap();
    assert_eq!(appended.seq, 2);
    assert!(!lock_path.exists());
}

/// Age a file's mtime by rewinding it `by` into the past.
fn filetime_like(path: &std::path::Path, by: Duration) -> bool {
    let target = std::time::SystemTime::now() - by;
    let file = match std::fs::File::options().write(true).open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    file.set_modified(target).is_ok()
}

#[tokio::test]
async fn test_user_sender_constant_on_helpers() {
    let dir = TempDir::new().unwrap();
    let log = DiscussionLog::new(dir.path());
    let id = new_discussion(&log, &["claude"]).await;

    let followup = log.append_followup(&id, "q".into(), None).await.unwrap();
    let end = log.append_end(&id, "d".into(), false).await.unwrap();
    assert_eq!(followup.from, USER_SENDER);
    assert_eq!(end.from, USER_SENDER);

    let messages = log.read_all(&id).await.unwrap();
    assert!(messages.iter().all(|m: &Message| m.seq >= 1));
}
