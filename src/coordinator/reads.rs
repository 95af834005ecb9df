//! Scatter-gather reads
//!
//! A read is registered with the set of shards it expects answers from.
//! It is finalized exactly once: either when the last expected shard answers
//! or when its deadline fires, whichever comes first. Keys owned by a shard
//! that never answered are simply missing from the result.

use crate::common::types::{ClientId, ClientTxId, Payload, ShardId};
use crate::common::utils::lock;
use crate::coordinator::deadline::DeadlineQueue;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type ReadId = u64;

/// Final result of a read, emitted once per read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub read_id: ReadId,
    pub client_tx_id: ClientTxId,
    pub client: ClientId,
    pub values: Payload,
    /// False when the deadline fired before every shard answered
    pub complete: bool,
}

struct ReadTransaction {
    client_tx_id: ClientTxId,
    client: ClientId,
    expected: BTreeSet<ShardId>,
    responded: BTreeSet<ShardId>,
    values: Payload,
}

impl ReadTransaction {
    fn is_complete(&self) -> bool {
        self.responded == self.expected
    }

    fn into_outcome(self, read_id: ReadId) -> ReadOutcome {
        let complete = self.is_complete();
        ReadOutcome {
            read_id,
            client_tx_id: self.client_tx_id,
            client: self.client,
            values: self.values,
            complete,
        }
    }
}

pub struct ReadTracker {
    reads: Mutex<HashMap<ReadId, ReadTransaction>>,
    next_read_id: AtomicU64,
    timeout: Duration,
    deadlines: DeadlineQueue<ReadId>,
    outcomes: mpsc::UnboundedSender<ReadOutcome>,
}

impl ReadTracker {
    /// Create the tracker and its deadline task. Must run inside a tokio runtime.
    pub fn new(timeout: Duration, outcomes: mpsc::UnboundedSender<ReadOutcome>) -> Arc<Self> {
        Arc::new_cyclic(|tracker: &Weak<Self>| {
            let tracker = tracker.clone();
            let deadlines = DeadlineQueue::spawn(move |read_id| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.expire(read_id);
                }
            });

            Self {
                reads: Mutex::new(HashMap::new()),
                next_read_id: AtomicU64::new(1),
                timeout,
                deadlines,
                outcomes,
            }
        })
    }

    /// Register a read waiting on `shards` and arm its deadline.
    pub fn begin(
        &self,
        client_tx_id: ClientTxId,
        client: ClientId,
        shards: BTreeSet<ShardId>,
    ) -> ReadId {
        let read_id = self.next_read_id.fetch_add(1, Ordering::SeqCst);
        let read = ReadTransaction {
            client_tx_id,
            client,
            expected: shards,
            responded: BTreeSet::new(),
            values: Payload::new(),
        };

        if read.is_complete() {
            self.finalize(read.into_outcome(read_id));
            return read_id;
        }

        lock(&self.reads).insert(read_id, read);
        self.deadlines.schedule(Instant::now() + self.timeout, read_id);
        read_id
    }

    /// Merge one shard's answer. Late, unexpected and repeated answers are
    /// ignored.
    pub fn on_response(&self, read_id: ReadId, shard: ShardId, values: Payload) {
        let done = {
            let mut reads = lock(&self.reads);
            let Some(read) = reads.get_mut(&read_id) else {
                tracing::debug!("Answer from shard {} for finished read {}", shard, read_id);
                return;
            };
            if !read.expected.contains(&shard) || !read.responded.insert(shard) {
                tracing::debug!(
                    "Ignoring duplicate answer from shard {} for read {}",
                    shard,
                    read_id
                );
                return;
            }
            read.values.extend(values);

            if read.is_complete() {
                reads.remove(&read_id)
            } else {
                None
            }
        };

        if let Some(read) = done {
            self.finalize(read.into_outcome(read_id));
        }
    }

    /// Finalize a read with whatever has been gathered so far.
    pub fn expire(&self, read_id: ReadId) {
        let Some(read) = lock(&self.reads).remove(&read_id) else {
            return;
        };

        let missing: Vec<ShardId> = read.expected.difference(&read.responded).copied().collect();
        tracing::warn!(
            "Read {} (client tx {}) timed out waiting for shards {:?}",
            read_id,
            read.client_tx_id,
            missing
        );
        self.finalize(read.into_outcome(read_id));
    }

    fn finalize(&self, outcome: ReadOutcome) {
        tracing::debug!(
            "Read {} finished with {} values (complete: {})",
            outcome.read_id,
            outcome.values.len(),
            outcome.complete
        );
        if self.outcomes.send(outcome).is_err() {
            tracing::debug!("Read outcome dropped, no listener");
        }
    }

    /// Reads still waiting on at least one shard
    pub fn pending(&self) -> usize {
        lock(&self.reads).len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
