//! Rate-limited work queue driving per-kind reconciliation
//!
//! Keys flow through the queue with client-go workqueue semantics:
//!
//! - a key is queued at most once, no matter how many producers add it;
//! - a key handed to a worker is not handed to another worker until the
//!   first calls [`WorkQueue::done`]; adds arriving meanwhile re-queue the
//!   key afterwards, so reconciles for one key are serialized;
//! - [`WorkQueue::add_after`] delivers a key no earlier than a deadline
//!   without blocking the caller, with concurrent delayed adds of the same
//!   key collapsing to the earliest deadline;
//! - [`WorkQueue::add_rate_limited`] applies per-key exponential backoff,
//!   reset by [`WorkQueue::forget`].
//!
//! Timers live inside the queue: [`WorkQueue::next`] promotes due delayed
//! entries itself, so workers stay free while long TTLs tick down.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// First retry delay for a failing key
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Ceiling on the per-key retry delay
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// A deduplicating, delay-capable, rate-limited queue of work keys.
///
/// Many producers (event handlers, delayed requeues, retry requeues) and
/// many consumers (workers) share one queue; all synchronization is
/// internal.
pub struct WorkQueue {
    state: Mutex<State>,
    wakeup: Notify,
}

struct State {
    /// Keys ready for immediate delivery, in arrival order
    ready: VecDeque<String>,
    /// Mirror of `ready` for O(1) dedup
    queued: HashSet<String>,
    /// Keys currently held by a worker
    active: HashSet<String>,
    /// Active keys that were re-added while held; re-queued on `done`
    dirty: HashSet<String>,
    /// Delayed entries ordered by deadline; stale entries are skipped at
    /// promotion time by checking `deadlines`
    delayed: BTreeMap<(Instant, u64), String>,
    /// Earliest pending deadline per key
    deadlines: HashMap<String, Instant>,
    /// Consecutive failure count per key, feeding the backoff
    failures: HashMap<String, u32>,
    seq: u64,
    shut_down: bool,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                dirty: HashSet::new(),
                delayed: BTreeMap::new(),
                deadlines: HashMap::new(),
                failures: HashMap::new(),
                seq: 0,
                shut_down: false,
            }),
            wakeup: Notify::new(),
        }
    }

    /// Add a key for immediate delivery.
    ///
    /// No-op if the key is already queued; if the key is being processed it
    /// is re-queued once the worker calls [`WorkQueue::done`].
    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        state.add(key);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Add a key for delivery no earlier than `delay` from now.
    ///
    /// Does not block. Multiple pending delayed adds of one key collapse to
    /// the earliest deadline.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        match state.deadlines.get(key) {
            // An earlier delivery is already pending; nothing to do.
            Some(existing) if *existing <= deadline => return,
            _ => {}
        }
        state.deadlines.insert(key.to_string(), deadline);
        state.seq += 1;
        let entry = (deadline, state.seq);
        state.delayed.insert(entry, key.to_string());
        drop(state);
        // Wake a sleeper so it re-arms its timer against the new deadline.
        self.wakeup.notify_one();
    }

    /// Add a key after its per-key backoff delay, doubling the delay for
    /// each consecutive failure up to the ceiling
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock();
            let attempts = state.failures.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            backoff_for(*attempts)
        };
        self.add_after(key, delay);
    }

    /// Clear the failure history of a key, so its next retry starts from
    /// the base delay again
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Release a key handed out by [`WorkQueue::next`].
    ///
    /// Must be called exactly once per delivered key, whatever the
    /// reconcile outcome. Re-queues the key if it was re-added while held.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shut_down {
            state.add(key);
            drop(state);
            self.wakeup.notify_one();
        }
    }

    /// Wait for the next ready key.
    ///
    /// Returns `None` once the queue has been shut down; pending and
    /// delayed entries are abandoned at that point.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Register interest before inspecting state, so an add that
            // races with the inspection leaves a wakeup permit behind.
            let wakeup = self.wakeup.notified();
            let next_deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                state.delayed.keys().next().map(|(deadline, _)| *deadline)
            };
            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = wakeup => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => wakeup.await,
            }
        }
    }

    /// Shut the queue down, waking every blocked consumer.
    ///
    /// Safe to call more than once.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.wakeup.notify_waiters();
    }

    /// Number of keys awaiting immediate delivery
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Whether no keys await immediate delivery
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The queue never panics while holding the lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn add(&mut self, key: &str) {
        if self.shut_down {
            return;
        }
        if self.active.contains(key) {
            self.dirty.insert(key.to_string());
            return;
        }
        if self.queued.insert(key.to_string()) {
            self.ready.push_back(key.to_string());
        }
    }

    /// Move every due delayed entry into the ready queue. Entries whose
    /// deadline no longer matches the per-key earliest deadline are stale
    /// leftovers from collapsed adds and are dropped.
    fn promote_due(&mut self, now: Instant) {
        while let Some((&(deadline, seq), _)) = self.delayed.first_key_value() {
            if deadline > now {
                break;
            }
            let key = match self.delayed.remove(&(deadline, seq)) {
                Some(key) => key,
                None => continue,
            };
            if self.deadlines.get(&key) == Some(&deadline) {
                self.deadlines.remove(&key);
                self.add(&key);
            }
        }
    }
}

/// Exponential backoff for the nth consecutive failure (pure function)
fn backoff_for(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(60);
    let millis = (BASE_DELAY.as_millis() as u64).saturating_mul(1u64 << exponent);
    Duration::from_millis(millis).min(MAX_DELAY)
}
