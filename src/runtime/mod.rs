//! The per-agent runtime: watcher scheduling, turn admission, bounded
//! concurrency, retry-with-backoff, and the per-discussion circuit
//! breaker.
//!
//! One `AgentRuntime` is one daemon. All mutable state lives in a single
//! `RuntimeState` behind one mutex; timers are tokio tasks whose handles
//! live in that state and die with it. The discussion log is the only
//! thing shared with other processes.

mod decision;
mod state;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentBackend, PromptContext, build_prompt};
use crate::config::RuntimeConfig;
use crate::discussion::{DiscussionLog, DiscussionStatus};
use crate::error::{Result, SkipReason};
use crate::message::{self, Message, Opinion, StatusKind};
use crate::reply::{self, ParsedReply};

pub use decision::{Trigger, Turn, should_respond};
pub use state::{PendingItem, RetryState, RuntimeState};

pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    backend: Arc<dyn AgentBackend>,
    log: DiscussionLog,
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    running: AtomicBool,
}

impl AgentRuntime {
    pub fn new(backend: Arc<dyn AgentBackend>, log: DiscussionLog, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                backend,
                log,
                config,
                state: Mutex::new(RuntimeState::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn agent_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(AtomicOrdering::SeqCst)
    }

    /// Register watchers for the prioritized active discussions and start
    /// the scan and cleanup timers. Fails only on an unusable base dir.
    pub async fn start(&self) -> Result<()> {
        self.inner.log.ensure_base_dir().await?;
        self.inner.running.store(true, AtomicOrdering::SeqCst);

        RuntimeInner::scan(&self.inner).await;

        let scan_inner = Arc::clone(&self.inner);
        let scan_timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_inner.config.scan_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !scan_inner.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                RuntimeInner::scan(&scan_inner).await;
            }
        });

        let cleanup_inner = Arc::clone(&self.inner);
        let cleanup_timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_inner.config.cleanup_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !cleanup_inner.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                RuntimeInner::cleanup_sweep(&cleanup_inner).await;
            }
        });

        {
            let mut st = self.inner.state.lock();
            st.scan_timer = Some(scan_timer);
            st.cleanup_timer = Some(cleanup_timer);
        }

        info!(agent = self.inner.backend.name(), "Agent runtime started");
        Ok(())
    }

    /// Stop scheduling: clears timers and the pending queue. In-flight
    /// child processes settle on their own timeouts.
    pub fn stop(&self) {
        self.inner.running.store(false, AtomicOrdering::SeqCst);
        let mut st = self.inner.state.lock();
        st.abort_all_timers();
        st.pending_queue.clear();
        info!(agent = self.inner.backend.name(), "Agent runtime stopped");
    }

    /// Run one poll cycle for a discussion immediately, outside its timer.
    pub async fn poll_now(&self, id: &str) {
        RuntimeInner::poll(&self.inner, id).await;
    }

    // Read-side inspection, mostly for the driver and tests.

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active_count
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .pending_queue
            .iter()
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_circuit_open(&self, id: &str) -> bool {
        self.inner
            .state
            .lock()
            .circuit_open_until
            .get(id)
            .is_some_and(|until| *until > Instant::now())
    }

    pub fn attempted_rounds(&self, id: &str) -> Vec<u32> {
        let mut rounds: Vec<u32> = self
            .inner
            .state
            .lock()
            .attempted_rounds
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        rounds.sort_unstable();
        rounds
    }
}

impl RuntimeInner {
    /// One poll: refresh bookkeeping, clean up on END, then run the turn
    /// decision and admission. Decisions are re-derived on every poll;
    /// the attempted-round and responding guards make that idempotent.
    async fn poll(self: &Arc<Self>, id: &str) {
        let messages = match self.log.read_all(id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(discussion = %id, error = %e, "Poll read failed");
                return;
            }
        };

        {
            let mut st = self.state.lock();
            st.last_watched_at.insert(id.to_string(), Instant::now());
            let newest = messages.last().map(|m| m.seq).unwrap_or(0);
            st.watched.insert(id.to_string(), newest);
        }

        if message::effective(&messages).iter().any(Message::is_end) {
            self.cleanup(id);
            return;
        }

        // A pending backoff owns the next attempt for this discussion.
        if self
            .state
            .lock()
            .retries
            .get(id)
            .is_some_and(|r| r.backing_off)
        {
            return;
        }

        let Some(turn) = should_respond(self.backend.name(), &messages, self.config.max_rounds)
        else {
            return;
        };

        match self.admit(id, turn.round) {
            Ok(()) => self.spawn_response(id.to_string(), turn.round),
            Err(skip) => {
                debug!(discussion = %id, round = turn.round, %skip, "Turn skipped");
                if matches!(
                    skip,
                    SkipReason::AlreadyResponding | SkipReason::AlreadyAttempted
                ) {
                    self.drain_queue().await;
                }
            }
        }
    }

    /// Admission for a turn candidate: circuit check, capacity and queue,
    /// then the per-discussion responding lock and round dedup.
    fn admit(self: &Arc<Self>, id: &str, round: u32) -> std::result::Result<(), SkipReason> {
        let mut st = self.state.lock();
        let now = Instant::now();

        if let Some(until) = st.circuit_open_until.get(id).copied() {
            if until > now {
                return Err(SkipReason::CircuitOpen);
            }
            st.circuit_open_until.remove(id);
            debug!(discussion = %id, "Circuit cooldown expired");
        }

        if st.active_count >= self.config.max_concurrent {
            if st.pending_queue.iter().any(|item| item.id == id) {
                return Err(SkipReason::Queued);
            }
            if st.pending_queue.len() >= self.config.max_queue_size
                && let Some(evicted) = st.pending_queue.pop_front()
            {
                warn!(
                    discussion = %evicted.id,
                    round = evicted.round,
                    "Pending queue full, evicting oldest"
                );
            }
            st.pending_queue.push_back(PendingItem {
                id: id.to_string(),
                round,
                enqueued_at: now,
            });
            return Err(SkipReason::Queued);
        }

        st.active_count += 1;
        if st.responding.contains(id) {
            st.active_count -= 1;
            return Err(SkipReason::AlreadyResponding);
        }
        if st
            .attempted_rounds
            .get(id)
            .is_some_and(|rounds| rounds.contains(&round))
        {
            st.active_count -= 1;
            return Err(SkipReason::AlreadyAttempted);
        }

        st.responding.insert(id.to_string());
        st.attempted_rounds
            .entry(id.to_string())
            .or_default()
            .insert(round);
        Ok(())
    }

    fn spawn_response(self: &Arc<Self>, id: String, round: u32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.execute_response(id, round).await;
        });
    }

    async fn execute_response(self: Arc<Self>, id: String, round: u32) {
        let agent = self.backend.name().to_string();

        if let Err(e) = self
            .log
            .append_status(
                &id,
                &agent,
                StatusKind::Thinking,
                "thinking".to_string(),
                Some(round),
            )
            .await
        {
            warn!(discussion = %id, error = %e, "Failed to append thinking status");
        }

        let messages = match self.log.read_all(&id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(discussion = %id, error = %e, "Failed to read discussion");
                self.finalize(&id, false).await;
                return;
            }
        };
        let status = DiscussionStatus::derive(&id, &messages);
        let working_dir = status.working_dir();
        let prompt = build_prompt(&PromptContext {
            agent: &agent,
            topic: &status.topic,
            participants: &status.participants,
            working_dir: working_dir.as_deref(),
            round,
            messages: message::effective(&messages),
        });

        let raw = match self.backend.respond(&prompt, working_dir.as_deref()).await {
            Ok(raw) => raw,
            Err(e) => {
                self.finalize(&id, false).await;
                if e.is_timeout() {
                    self.handle_timeout(&id, round).await;
                } else {
                    self.record_error(&id, &agent, e.to_string(), round).await;
                }
                return;
            }
        };

        // Identity validation gets one in-place retry, not the backoff chain.
        let parsed = match ParsedReply::parse(&raw, &agent, &status.participants) {
            Ok(parsed) => Ok(parsed),
            Err(invalid) => {
                warn!(discussion = %id, error = %invalid, "Reply failed validation, retrying once");
                if let Err(e) = self
                    .log
                    .append_status(
                        &id,
                        &agent,
                        StatusKind::Retrying,
                        format!("invalid reply: {invalid}"),
                        Some(round),
                    )
                    .await
                {
                    warn!(discussion = %id, error = %e, "Failed to append retrying status");
                }
                match self.backend.respond(&prompt, working_dir.as_deref()).await {
                    Ok(raw) => ParsedReply::parse(&raw, &agent, &status.participants),
                    Err(e) => {
                        self.finalize(&id, false).await;
                        if e.is_timeout() {
                            self.handle_timeout(&id, round).await;
                        } else {
                            self.record_error(&id, &agent, e.to_string(), round).await;
                        }
                        return;
                    }
                }
            }
        };

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(invalid) => {
                self.finalize(&id, false).await;
                self.record_error(&id, &agent, invalid.to_string(), round)
                    .await;
                return;
            }
        };

        let content = if parsed.opinion == Opinion::Agree {
            let counterpart = status
                .participants
                .iter()
                .find(|p| !p.eq_ignore_ascii_case(&agent))
                .cloned()
                .unwrap_or_else(|| "对方".to_string());
            reply::ensure_closure(&parsed.body, &counterpart)
        } else {
            parsed.body.clone()
        };

        match self
            .log
            .append_response(&id, &agent, round, parsed.opinion, content, parsed.confidence)
            .await
        {
            Ok(appended) => {
                info!(
                    discussion = %id,
                    round,
                    seq = appended.seq,
                    opinion = ?parsed.opinion,
                    "Response appended"
                );
                self.finalize(&id, true).await;
            }
            Err(e) => {
                // Lift the round guard so a later poll can retry the append.
                warn!(discussion = %id, round, error = %e, "Failed to append response");
                if let Some(rounds) = self.state.lock().attempted_rounds.get_mut(&id) {
                    rounds.remove(&round);
                }
                self.finalize(&id, false).await;
            }
        }
    }

    async fn record_error(self: &Arc<Self>, id: &str, agent: &str, error: String, round: u32) {
        if let Err(e) = self
            .log
            .append_error(id, agent, error, Some(round))
            .await
        {
            warn!(discussion = %id, error = %e, "Failed to append error record");
        }
    }

    /// Timeout path: count the attempt, emit a retrying status, lift the
    /// round guard, and re-enter admission after the backoff sleep.
    async fn handle_timeout(self: &Arc<Self>, id: &str, round: u32) {
        let agent = self.backend.name().to_string();

        let (attempt, max, exhausted) = {
            let mut st = self.state.lock();
            let entry = st
                .retries
                .entry(id.to_string())
                .or_insert_with(|| RetryState {
                    attempt: 0,
                    max: self.config.max_retries,
                    backing_off: false,
                });
            entry.attempt += 1;
            let attempt = entry.attempt;
            let max = entry.max;
            let exhausted = attempt > max;
            if exhausted {
                st.retries.remove(id);
            } else {
                if let Some(retry) = st.retries.get_mut(id) {
                    retry.backing_off = true;
                }
                if let Some(rounds) = st.attempted_rounds.get_mut(id) {
                    rounds.remove(&round);
                }
            }
            (attempt, max, exhausted)
        };

        if exhausted {
            warn!(discussion = %id, round, attempts = max, "Timeout retries exhausted");
            self.record_error(
                id,
                &agent,
                format!("Timeout: {max} retries exhausted"),
                round,
            )
            .await;
            return;
        }

        if let Err(e) = self
            .log
            .append_status(
                id,
                &agent,
                StatusKind::Retrying,
                format!("{attempt}/{max}"),
                Some(round),
            )
            .await
        {
            warn!(discussion = %id, error = %e, "Failed to append retrying status");
        }

        let delay = self.config.retry_delay(attempt);
        info!(
            discussion = %id,
            round,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );

        let inner = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.running.load(AtomicOrdering::SeqCst) {
                return;
            }
            if let Some(retry) = inner.state.lock().retries.get_mut(&id) {
                retry.backing_off = false;
            }
            let messages = match inner.log.read_all(&id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(discussion = %id, error = %e, "Retry read failed");
                    return;
                }
            };
            let Some(turn) =
                should_respond(inner.backend.name(), &messages, inner.config.max_rounds)
            else {
                inner.state.lock().retries.remove(&id);
                debug!(discussion = %id, "Retry no longer needed");
                return;
            };
            match inner.admit(&id, turn.round) {
                Ok(()) => inner.spawn_response(id.clone(), turn.round),
                Err(skip) => debug!(discussion = %id, %skip, "Retry admission skipped"),
            }
        });
    }

    /// Release the responding lock, settle the failure counters, and give
    /// queued candidates a chance at the freed slot.
    async fn finalize(self: &Arc<Self>, id: &str, success: bool) {
        {
            let mut st = self.state.lock();
            st.responding.remove(id);
            st.active_count = st.active_count.saturating_sub(1);

            if success {
                st.failures.remove(id);
                st.circuit_open_until.remove(id);
                st.retries.remove(id);
            } else {
                let count = {
                    let failures = st.failures.entry(id.to_string()).or_insert(0);
                    *failures += 1;
                    *failures
                };
                if count >= self.config.circuit_threshold {
                    let until = Instant::now() + self.config.circuit_cooldown();
                    st.circuit_open_until.insert(id.to_string(), until);
                    warn!(
                        discussion = %id,
                        failures = count,
                        cooldown_ms = self.config.circuit_cooldown_ms,
                        "Local circuit opened"
                    );
                }
            }
        }
        self.drain_queue().await;
    }

    /// Pop queued candidates while slots are free, re-deriving the turn
    /// decision for each. The `draining` flag stops recursive storms:
    /// responses finalized during the loop skip their own drain.
    async fn drain_queue(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.draining {
                return;
            }
            st.draining = true;
        }

        loop {
            let item = {
                let mut st = self.state.lock();
                if st.active_count >= self.config.max_concurrent {
                    None
                } else {
                    st.pending_queue.pop_front()
                }
            };
            let Some(item) = item else {
                break;
            };

            let messages = match self.log.read_all(&item.id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(discussion = %item.id, error = %e, "Drain read failed");
                    continue;
                }
            };
            let Some(turn) =
                should_respond(self.backend.name(), &messages, self.config.max_rounds)
            else {
                debug!(discussion = %item.id, "Queued turn no longer applies");
                continue;
            };
            match self.admit(&item.id, turn.round) {
                Ok(()) => self.spawn_response(item.id.clone(), turn.round),
                Err(skip) => debug!(discussion = %item.id, %skip, "Drained turn skipped"),
            }
        }

        self.state.lock().draining = false;
    }

    /// Re-run prioritization: watch the liveliest active discussions,
    /// registering new watchers and releasing deprioritized ones.
    async fn scan(self: &Arc<Self>) {
        let active = match self.log.list_active().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Scan enumeration failed");
                return;
            }
        };

        let mut scored = Vec::with_capacity(active.len());
        for id in active {
            let mtime = tokio::fs::metadata(self.log.log_path(&id))
                .await
                .ok()
                .and_then(|meta| meta.modified().ok());
            scored.push((id, mtime));
        }

        let last_polled = {
            let st = self.state.lock();
            st.last_watched_at.clone()
        };
        scored.sort_by(|(a_id, a_mtime), (b_id, b_mtime)| {
            // Most recent activity first, then longest since last poll
            // (never-polled counts as oldest) so nothing starves.
            b_mtime.cmp(a_mtime).then_with(|| {
                match (last_polled.get(a_id), last_polled.get(b_id)) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(a), Some(b)) => a.cmp(b),
                }
            })
        });

        let keep: HashSet<String> = scored
            .into_iter()
            .take(self.config.max_watched_discussions)
            .map(|(id, _)| id)
            .collect();

        let current: Vec<String> = {
            let st = self.state.lock();
            st.timers.keys().cloned().collect()
        };

        for id in &keep {
            self.spawn_watcher(id.clone());
        }
        for id in current {
            if !keep.contains(&id) {
                let mut st = self.state.lock();
                if !st.responding.contains(&id) {
                    st.release_watcher(&id);
                    debug!(discussion = %id, "Watcher released (deprioritized)");
                }
            }
        }
    }

    /// Drop discussions that ended or whose file disappeared.
    async fn cleanup_sweep(self: &Arc<Self>) {
        let watched: Vec<String> = {
            let st = self.state.lock();
            st.timers.keys().cloned().collect()
        };
        for id in watched {
            let exists = tokio::fs::try_exists(self.log.log_path(&id))
                .await
                .unwrap_or(false);
            if !exists {
                self.cleanup(&id);
                continue;
            }
            match self.log.status(&id).await {
                Ok(status) if status.ended => self.cleanup(&id),
                Ok(_) => {}
                Err(e) => {
                    warn!(discussion = %id, error = %e, "Cleanup status failed");
                    self.cleanup(&id);
                }
            }
        }
    }

    fn cleanup(self: &Arc<Self>, id: &str) {
        let mut st = self.state.lock();
        st.forget(id);
        info!(discussion = %id, "Discussion released");
    }

    fn spawn_watcher(self: &Arc<Self>, id: String) {
        let mut st = self.state.lock();
        if st.timers.contains_key(&id) {
            return;
        }
        let inner = Arc::clone(self);
        let watched_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !inner.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                RuntimeInner::poll(&inner, &watched_id).await;
            }
        });
        st.timers.insert(id.clone(), handle);
        debug!(discussion = %id, "Watcher registered");
    }
}
