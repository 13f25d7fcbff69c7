//! Keyed mutex: an async mutual-exclusion map over arbitrary string keys.
//!
//! Independent of the field-lock table. Where field locks are advisory
//! and answer immediately, this primitive makes the caller *wait*: a
//! `lock` on a held key parks the task on a FIFO queue until the current
//! holder calls `unlock`. Server-side critical sections (import jobs,
//! schema edits) serialize on it without inventing a key scheme upfront.
//!
//! There is no ownership tracking and no guard type. Whoever calls
//! `unlock` releases the key, and a caller that acquires a key and never
//! unlocks it (including a task cancelled after the handoff already
//! happened) wedges that key forever. Callers pair every `lock` with an
//! `unlock` on all paths.

use std::collections::{HashMap, VecDeque};
use tokio::sync::{oneshot, Mutex};

struct KeyState {
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Async mutex over dynamic string keys. Key present in the map means
/// held; absent means free.
pub struct KeyedMutex {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `key`, waiting behind earlier claimants if it is held.
    ///
    /// Returns once this caller owns the key. Waiters are woken strictly
    /// in arrival order.
    pub async fn lock(&self, key: impl Into<String>) {
        let key = key.into();
        let rx = {
            let mut keys = self.keys.lock().await;
            match keys.get_mut(&key) {
                None => {
                    keys.insert(
                        key,
                        KeyState {
                            waiters: VecDeque::new(),
                        },
                    );
                    return;
                }
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    rx
                }
            }
        };
        // Held: park until the holder hands the key over. The map mutex
        // is dropped first so other keys stay usable while we wait.
        // An Err here means the key record was torn down with this waiter
        // still queued; the key is free again either way.
        let _ = rx.await;
    }

    /// Release `key`, handing it to the oldest live waiter if any.
    ///
    /// Dead waiters (tasks that gave up waiting) are skipped. Releasing
    /// a key nobody holds is logged and ignored.
    pub async fn unlock(&self, key: &str) {
        let mut keys = self.keys.lock().await;
        let Some(state) = keys.get_mut(key) else {
            log::warn!("Unlock of unheld key {key:?}");
            return;
        };
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                // Handed over; the key record stays, now owned by the
                // woken waiter.
                return;
            }
        }
        keys.remove(key);
    }

    /// Whether `key` is currently held.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.keys.lock().await.contains_key(key)
    }

    /// Number of held keys.
    pub async fn held_count(&self) -> usize {
        self.keys.lock().await.len()
    }

    /// Number of tasks queued behind `key`, counting waiters that have
    /// since given up until the next unlock sweeps them out.
    pub async fn waiter_count(&self, key: &str) -> usize {
        self.keys
            .lock()
            .await
            .get(key)
            .map_or(0, |state| state.waiters.len())
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}
