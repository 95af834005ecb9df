//! Per-key exclusive locks with FIFO hand-off
//!
//! Each key carries a busy flag and a queue of parked waiters. A waiter is a
//! oneshot channel: the releasing side sends on it to hand ownership over
//! directly, so a contended key is never observed as free in between.
//!
//! Keys of one request are always taken in ascending order, so two requests
//! on the same shard cannot wait on each other. Across shards the coordinator
//! keeps the order by preparing one shard at a time in ascending shard id.

use crate::common::types::{Key, KeySet};
use crate::common::utils::lock;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct KeyLock {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Snapshot of one key's lock bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyState {
    pub busy: bool,
    pub waiters: usize,
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<Key, KeyLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request exclusive ownership of every key in `keys`.
    ///
    /// Queue positions are taken when this is called, not when the returned
    /// future is first polled. The future resolves once every key has been
    /// granted. Dropping it before it resolves forfeits the queued positions;
    /// keys already granted stay held and must still be released.
    pub fn acquire(&self, keys: &KeySet) -> impl Future<Output = ()> + Send + 'static {
        let mut pending = Vec::new();
        {
            let mut table = lock(&self.table);
            for key in keys {
                let entry = table.entry(*key).or_default();
                if entry.busy {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push_back(tx);
                    pending.push((*key, rx));
                } else {
                    entry.busy = true;
                }
            }
        }

        async move {
            for (key, grant) in pending {
                // A closed channel means the manager itself is gone.
                if grant.await.is_err() {
                    tracing::debug!("Lock manager dropped while waiting on key {}", key);
                }
            }
        }
    }

    /// Release after commit: hand each key to its next waiter or mark it free.
    pub fn release(&self, keys: &KeySet) {
        let mut table = lock(&self.table);
        for key in keys {
            if let Some(entry) = table.get_mut(key) {
                Self::hand_off(*key, entry);
            }
        }
    }

    /// Release after abort.
    ///
    /// Like [`release`](Self::release), but a key left without waiters that
    /// `exists` reports as absent from the value map loses its bookkeeping
    /// entirely. Keys that exist keep their known-and-free state.
    pub fn release_abort<F>(&self, keys: &KeySet, exists: F)
    where
        F: Fn(Key) -> bool,
    {
        let mut table = lock(&self.table);
        for key in keys {
            let Some(entry) = table.get_mut(key) else {
                continue;
            };
            if !Self::hand_off(*key, entry) && !exists(*key) {
                table.remove(key);
                tracing::debug!("Dropped lock bookkeeping for unwritten key {}", key);
            }
        }
    }

    /// Returns true when ownership moved to a waiter.
    fn hand_off(key: Key, entry: &mut KeyLock) -> bool {
        while let Some(waiter) = entry.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return true;
            }
        }
        entry.busy = false;
        tracing::debug!("Unlocked {}", key);
        false
    }

    pub fn key_state(&self, key: Key) -> Option<KeyState> {
        lock(&self.table).get(&key).map(|entry| KeyState {
            busy: entry.busy,
            waiters: entry.waiters.len(),
        })
    }

    /// Number of keys with bookkeeping
    pub fn tracked_keys(&self) -> usize {
        lock(&self.table).len()
    }
}
