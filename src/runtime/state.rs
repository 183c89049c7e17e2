//! In-memory tables the runtime owns, one instance per agent process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use tokio::task::JoinHandle;

/// Per-discussion retry progress for timeout backoff.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// 1-indexed number of the retry currently pending or underway.
    pub attempt: u32,
    pub max: u32,
    /// True while the backoff sleep owns the next attempt; the poll path
    /// must not re-offer the round until it clears.
    pub backing_off: bool,
}

/// A turn candidate awaiting a concurrency slot.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub id: String,
    pub round: u32,
    pub enqueued_at: Instant,
}

/// All mutable runtime state, guarded by a single mutex. Contention is
/// negligible: every critical section is a few map operations.
#[derive(Default)]
pub struct RuntimeState {
    /// discussion id -> last observed seq.
    pub watched: HashMap<String, u64>,
    /// discussion id -> most recent poll time.
    pub last_watched_at: HashMap<String, Instant>,
    /// discussion id -> periodic watcher task.
    pub timers: HashMap<String, JoinHandle<()>>,
    pub scan_timer: Option<JoinHandle<()>>,
    pub cleanup_timer: Option<JoinHandle<()>>,
    /// Discussions currently being served; per-discussion mutual exclusion.
    pub responding: HashSet<String>,
    /// Rounds attempted this process lifetime, per discussion.
    pub attempted_rounds: HashMap<String, HashSet<u32>>,
    pub retries: HashMap<String, RetryState>,
    /// Consecutive failure counts feeding the circuit breaker.
    pub failures: HashMap<String, u32>,
    pub circuit_open_until: HashMap<String, Instant>,
    /// In-flight responses across all discussions.
    pub active_count: usize,
    pub pending_queue: VecDeque<PendingItem>,
    /// Re-entry guard for queue draining.
    pub draining: bool,
}

impl RuntimeState {
    /// Full release of one discussion: watcher timer, bookkeeping, retry
    /// and circuit state, and any queued candidates.
    pub fn forget(&mut self, id: &str) {
        if let Some(timer) = self.timers.remove(id) {
            timer.abort();
        }
        self.watched.remove(id);
        self.last_watched_at.remove(id);
        self.responding.remove(id);
        self.attempted_rounds.remove(id);
        self.retries.remove(id);
        self.failures.remove(id);
        self.circuit_open_until.remove(id);
        self.pending_queue.retain(|item| item.id != id);
    }

    /// Drop just the watcher (deprioritized by a scan). Decision state is
    /// kept so a re-added watcher cannot repeat a round.
    pub fn release_watcher(&mut self, id: &str) {
        if let Some(timer) = self.timers.remove(id) {
            timer.abort();
        }
        self.watched.remove(id);
        self.last_watched_at.remove(id);
    }

    pub fn abort_all_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.cleanup_timer.take() {
            timer.abort();
        }
    }
}
