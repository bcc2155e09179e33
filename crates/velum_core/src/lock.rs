//! Per-key lock manager providing strict two-phase locking.
//!
//! Locks are created lazily on first acquire and deleted once nothing
//! holds or waits on them. All lock state lives under one mutex; blocked
//! acquires park on a condition variable and are resumed exactly once,
//! in queue order, through a registry of wait decisions keyed by
//! `(key, transaction)`.
//!
//! There is no wait-for graph: deadlocks are broken solely by the
//! acquire timeout, and the caller is responsible for rolling back the
//! owning transaction after a timeout.

use crate::error::{EngineError, EngineResult};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::warn;

/// Queue length past which a key is flagged for observability.
const SUSPICIOUS_QUEUE_LEN: usize = 16;

/// Lock modes for read/write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock for reads; multiple holders allowed.
    Shared,
    /// Exclusive lock for writes; a single holder, no readers.
    Exclusive,
}

/// A queued lock request.
#[derive(Debug)]
struct Waiter {
    txn: TransactionId,
    mode: LockMode,
}

/// State of one key's lock.
#[derive(Debug)]
struct LockState {
    mode: LockMode,
    holders: HashSet<TransactionId>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn empty() -> Self {
        Self {
            mode: LockMode::Shared,
            holders: HashSet::new(),
            waiters: VecDeque::new(),
        }
    }

    fn unused(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

/// Outcome delivered to a parked acquire.
#[derive(Debug, Clone, Copy)]
enum WaitDecision {
    Granted,
    Cancelled,
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, LockState>,
    /// Wait continuations: one pending decision per parked `(key, txn)`.
    decisions: HashMap<(String, TransactionId), WaitDecision>,
}

/// Per-key shared/exclusive lock manager with FIFO wait queues.
pub struct LockManager {
    table: Mutex<LockTable>,
    wakeup: Condvar,
    timeout: Duration,
}

impl LockManager {
    /// Creates a lock manager with the given acquire timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            wakeup: Condvar::new(),
            timeout,
        }
    }

    /// Acquires `key` in `mode` for `txn`, blocking until granted.
    ///
    /// A request is granted immediately when the transaction already
    /// holds the lock (including an upgrade to exclusive as sole
    /// holder), when nothing holds it, or when both the request and the
    /// current mode are shared. Otherwise the request joins the FIFO
    /// queue.
    ///
    /// # Errors
    ///
    /// - [`EngineError::LockTimeout`] after waiting longer than the
    ///   configured timeout; the caller must roll the transaction back
    /// - [`EngineError::TransactionAborted`] when the queued request was
    ///   cancelled by [`LockManager::release_all`]
    pub fn acquire(&self, key: &str, txn: TransactionId, mode: LockMode) -> EngineResult<()> {
        let mut table = self.table.lock();

        let state = table
            .locks
            .entry(key.to_string())
            .or_insert_with(LockState::empty);
        if try_grant(state, txn, mode) {
            return Ok(());
        }

        state.waiters.push_back(Waiter { txn, mode });
        if state.waiters.len() > SUSPICIOUS_QUEUE_LEN {
            warn!(
                key,
                queue = state.waiters.len(),
                "lock queue unusually long"
            );
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let timed_out = self.wakeup.wait_until(&mut table, deadline).timed_out();

            if let Some(decision) = table.decisions.remove(&(key.to_string(), txn)) {
                return match decision {
                    WaitDecision::Granted => Ok(()),
                    WaitDecision::Cancelled => Err(EngineError::transaction_aborted(txn)),
                };
            }

            if timed_out {
                if let Some(state) = table.locks.get_mut(key) {
                    state.waiters.retain(|w| w.txn != txn);
                    if state.unused() {
                        table.locks.remove(key);
                    }
                }
                return Err(EngineError::lock_timeout(key, txn));
            }
        }
    }

    /// Releases a single hold of `txn` on `key` and advances the queue.
    pub fn release(&self, key: &str, txn: TransactionId) {
        let mut table = self.table.lock();

        let mut granted = Vec::new();
        if let Some(state) = table.locks.get_mut(key) {
            if state.holders.remove(&txn) {
                granted = drain(state);
            }
            if state.unused() {
                table.locks.remove(key);
            }
        }

        let woke = !granted.is_empty();
        for grantee in granted {
            table
                .decisions
                .insert((key.to_string(), grantee), WaitDecision::Granted);
        }
        if woke {
            self.wakeup.notify_all();
        }
    }

    /// Releases every hold of `txn` and cancels its queued requests.
    ///
    /// Cancelled waiters fail their acquire with `TransactionAborted`.
    pub fn release_all(&self, txn: TransactionId) {
        let mut table = self.table.lock();

        let mut granted: Vec<(String, TransactionId)> = Vec::new();
        let mut cancelled: Vec<String> = Vec::new();

        for (key, state) in table.locks.iter_mut() {
            let mut was_queued = false;
            state.waiters.retain(|w| {
                if w.txn == txn {
                    was_queued = true;
                    false
                } else {
                    true
                }
            });
            if was_queued {
                cancelled.push(key.clone());
            }

            if state.holders.remove(&txn) || was_queued {
                for grantee in drain(state) {
                    granted.push((key.clone(), grantee));
                }
            }
        }

        table.locks.retain(|_, state| !state.unused());

        for key in cancelled {
            table.decisions.insert((key, txn), WaitDecision::Cancelled);
        }
        for (key, grantee) in granted {
            table.decisions.insert((key, grantee), WaitDecision::Granted);
        }
        self.wakeup.notify_all();
    }

    /// Returns the number of keys with live lock state.
    #[must_use]
    pub fn locked_keys(&self) -> usize {
        self.table.lock().locks.len()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout", &self.timeout)
            .field("locked_keys", &self.locked_keys())
            .finish_non_exhaustive()
    }
}

/// Applies the immediate-grant rules. Returns whether the request holds.
fn try_grant(state: &mut LockState, txn: TransactionId, mode: LockMode) -> bool {
    if state.holders.contains(&txn) {
        match (state.mode, mode) {
            (LockMode::Shared, LockMode::Exclusive) => {
                if state.holders.len() == 1 {
                    state.mode = LockMode::Exclusive;
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    } else if state.holders.is_empty() {
        state.mode = mode;
        state.holders.insert(txn);
        true
    } else if mode == LockMode::Shared && state.mode == LockMode::Shared {
        state.holders.insert(txn);
        true
    } else {
        false
    }
}

/// Advances the waiter queue after holder-set changes.
///
/// With no holders left: grant a single exclusive head, or the whole
/// consecutive shared prefix. With exactly one holder left: complete a
/// waiting upgrade when the head waiter is that holder asking for
/// exclusive (the queue never drains otherwise, because the upgrader is
/// itself a holder).
fn drain(state: &mut LockState) -> Vec<TransactionId> {
    let mut granted = Vec::new();

    if state.holders.is_empty() {
        match state.waiters.front().map(|w| w.mode) {
            Some(LockMode::Exclusive) => {
                if let Some(waiter) = state.waiters.pop_front() {
                    state.mode = LockMode::Exclusive;
                    state.holders.insert(waiter.txn);
                    granted.push(waiter.txn);
                }
            }
            Some(LockMode::Shared) => {
                state.mode = LockMode::Shared;
                while state.waiters.front().map(|w| w.mode) == Some(LockMode::Shared) {
                    if let Some(waiter) = state.waiters.pop_front() {
                        state.holders.insert(waiter.txn);
                        granted.push(waiter.txn);
                    }
                }
            }
            None => {}
        }
    } else if state.holders.len() == 1 {
        let head_upgrades = state
            .waiters
            .front()
            .is_some_and(|w| w.mode == LockMode::Exclusive && state.holders.contains(&w.txn));
        if head_upgrades {
            if let Some(waiter) = state.waiters.pop_front() {
                state.mode = LockMode::Exclusive;
                granted.push(waiter.txn);
            }
        }
    }

    granted
}
