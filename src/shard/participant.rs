//! 2PC participant for one shard
//!
//! Prepare takes the key locks and durably records the vote, commit applies
//! the payload and releases, abort releases without applying. Every decision
//! is written to the decision log before it is acknowledged.
//!
//! Decided transactions are remembered so duplicate commit and abort messages
//! stay idempotent, but only the most recent ones: the table keeps a window of
//! decisions and forgets the oldest beyond it.

use crate::common::decision_log::DecisionLog;
use crate::common::types::{KeySet, Payload, ShardId, TxId};
use crate::common::utils::lock;
use crate::common::{Error, Result};
use crate::shard::lock_manager::LockManager;
use crate::shard::store::ValueStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// Decided transactions remembered per shard unless configured otherwise
pub const DEFAULT_DECIDED_RETENTION: usize = 100_000;

/// What a participant writes to its decision log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRecord {
    /// Locks held, vote is yes
    Prepared { payload: Payload },
    Committed { payload: Payload },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug)]
enum TxState {
    /// Waiting for key locks; duplicate prepares subscribe to the status
    Preparing(watch::Receiver<PrepareStatus>),
    Prepared(Payload),
    Committed,
    Aborted,
}

impl TxState {
    fn is_decided(&self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }
}

/// Per-transaction state plus the ring of recent decisions
struct TxTable {
    states: HashMap<TxId, TxState>,
    decided: VecDeque<TxId>,
    retention: usize,
}

impl TxTable {
    fn new(retention: usize) -> Self {
        Self {
            states: HashMap::new(),
            decided: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    /// Record a decision and forget the oldest ones past the retention window.
    fn decide(&mut self, tx_id: TxId, state: TxState) {
        self.states.insert(tx_id, state);
        self.decided.push_back(tx_id);
        while self.decided.len() > self.retention {
            let Some(oldest) = self.decided.pop_front() else {
                break;
            };
            if self.states.get(&oldest).is_some_and(TxState::is_decided) {
                self.states.remove(&oldest);
            }
        }
    }
}

pub struct Participant {
    shard: ShardId,
    locks: LockManager,
    store: ValueStore,
    log: DecisionLog<ParticipantRecord>,
    transactions: Mutex<TxTable>,
    halted: AtomicBool,
    halt: Notify,
}

fn key_set(payload: &Payload) -> KeySet {
    payload.keys().copied().collect()
}

impl Participant {
    /// Create a participant with an empty value map over `log`.
    ///
    /// Use [`recover`](Self::recover) instead when the log may hold entries
    /// from a previous run.
    pub fn new(shard: ShardId, log: DecisionLog<ParticipantRecord>) -> Arc<Self> {
        Self::with_retention(shard, log, DEFAULT_DECIDED_RETENTION)
    }

    /// Like [`new`](Self::new), remembering at most `retention` decided
    /// transactions.
    pub fn with_retention(
        shard: ShardId,
        log: DecisionLog<ParticipantRecord>,
        retention: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            locks: LockManager::new(),
            store: ValueStore::new(),
            log,
            transactions: Mutex::new(TxTable::new(retention)),
            halted: AtomicBool::new(false),
            halt: Notify::new(),
        })
    }

    /// Rebuild participant state from its decision log.
    ///
    /// Committed payloads are re-applied in log order, recent decided
    /// transactions are remembered, and in-doubt transactions (prepared,
    /// undecided) take their key locks again so the coordinator's decision
    /// finds them held.
    pub async fn recover(shard: ShardId, log: DecisionLog<ParticipantRecord>) -> Result<Arc<Self>> {
        Self::recover_with_retention(shard, log, DEFAULT_DECIDED_RETENTION).await
    }

    pub async fn recover_with_retention(
        shard: ShardId,
        log: DecisionLog<ParticipantRecord>,
        retention: usize,
    ) -> Result<Arc<Self>> {
        let entries = log.read_all()?;
        let participant = Self::with_retention(shard, log, retention);

        let mut table = TxTable::new(retention);
        let mut prepare_order = Vec::new();
        let mut committed = 0usize;
        let mut aborted = 0usize;

        for entry in entries {
            match entry.record {
                ParticipantRecord::Prepared { payload } => {
                    // An abort that overtook a lock wait is logged before the
                    // vote; the transaction stays aborted.
                    if !table.states.contains_key(&entry.tx_id) {
                        prepare_order.push(entry.tx_id);
                        table.states.insert(entry.tx_id, TxState::Prepared(payload));
                    }
                }
                ParticipantRecord::Committed { payload } => {
                    participant.store.apply(&payload);
                    table.decide(entry.tx_id, TxState::Committed);
                    committed += 1;
                }
                ParticipantRecord::Aborted => {
                    table.decide(entry.tx_id, TxState::Aborted);
                    aborted += 1;
                }
            }
        }

        let mut in_doubt = 0usize;
        for tx_id in prepare_order {
            if let Some(TxState::Prepared(payload)) = table.states.get(&tx_id) {
                participant.locks.acquire(&key_set(payload)).await;
                in_doubt += 1;
            }
        }

        *lock(&participant.transactions) = table;

        tracing::info!(
            "Shard {} recovered: {} committed, {} aborted, {} in doubt, {} keys",
            shard,
            committed,
            aborted,
            in_doubt,
            participant.store.len()
        );

        Ok(participant)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Phase one: lock every key of the payload and record the yes vote.
    ///
    /// Resolves once all locks are granted and the vote is durable. A repeated
    /// prepare for the same transaction waits on the first one instead of
    /// queueing for the locks again.
    pub async fn prepare(self: &Arc<Self>, tx_id: TxId, payload: Payload) -> Result<()> {
        self.ensure_running()?;

        let mut status = {
            let mut txs = lock(&self.transactions);
            match txs.states.get(&tx_id) {
                Some(TxState::Preparing(status)) => status.clone(),
                Some(TxState::Prepared(_)) => return Ok(()),
                Some(TxState::Committed) | Some(TxState::Aborted) => {
                    return Err(Error::InvalidTransition {
                        tx_id,
                        reason: "prepare after decision".into(),
                    })
                }
                None => {
                    let (sender, status) = watch::channel(PrepareStatus::Pending);
                    txs.states.insert(tx_id, TxState::Preparing(status.clone()));

                    // The lock wait runs in its own task so a cancelled caller
                    // cannot strand half-granted locks.
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = this.run_prepare(tx_id, payload).await;
                        sender.send_replace(outcome);
                    });
                    status
                }
            }
        };

        let outcome = status
            .wait_for(|s| *s != PrepareStatus::Pending)
            .await
            .map(|s| *s)
            .unwrap_or(PrepareStatus::Failed);

        match outcome {
            PrepareStatus::Ready => Ok(()),
            _ if self.is_halted() => Err(Error::NodeHalted),
            _ => Err(Error::InvalidTransition {
                tx_id,
                reason: "prepare did not complete".into(),
            }),
        }
    }

    async fn run_prepare(&self, tx_id: TxId, payload: Payload) -> PrepareStatus {
        let keys = key_set(&payload);
        tracing::debug!("Shard {} tx {} waiting for {} keys", self.shard, tx_id, keys.len());
        self.locks.acquire(&keys).await;

        if !self.is_preparing(tx_id) {
            return self.drop_aborted_prepare(tx_id, &keys);
        }

        let record = ParticipantRecord::Prepared {
            payload: payload.clone(),
        };
        if let Err(e) = self.log.write(tx_id, &record) {
            self.fail(&e);
            self.locks.release_abort(&keys, |key| self.store.contains(key));
            let mut txs = lock(&self.transactions);
            if matches!(txs.states.get(&tx_id), Some(TxState::Preparing(_))) {
                txs.states.remove(&tx_id);
            }
            return PrepareStatus::Failed;
        }

        {
            let mut txs = lock(&self.transactions);
            if matches!(txs.states.get(&tx_id), Some(TxState::Preparing(_))) {
                txs.states.insert(tx_id, TxState::Prepared(payload));
                tracing::debug!("Shard {} tx {} prepared", self.shard, tx_id);
                return PrepareStatus::Ready;
            }
        }
        self.drop_aborted_prepare(tx_id, &keys)
    }

    fn is_preparing(&self, tx_id: TxId) -> bool {
        matches!(
            lock(&self.transactions).states.get(&tx_id),
            Some(TxState::Preparing(_))
        )
    }

    /// The transaction was aborted while its prepare waited; hand back the
    /// locks it was just granted.
    fn drop_aborted_prepare(&self, tx_id: TxId, keys: &KeySet) -> PrepareStatus {
        self.locks.release_abort(keys, |key| self.store.contains(key));
        tracing::debug!("Shard {} tx {} aborted while waiting for locks", self.shard, tx_id);
        PrepareStatus::Failed
    }

    /// Phase two, commit: log the decision, apply the prepared payload as one
    /// batch, then hand the keys to their next waiters.
    pub fn commit(&self, tx_id: TxId, payload: &Payload) -> Result<()> {
        self.ensure_running()?;

        let prepared = {
            let mut txs = lock(&self.transactions);
            match txs.states.remove(&tx_id) {
                Some(TxState::Prepared(prepared)) => {
                    txs.decide(tx_id, TxState::Committed);
                    prepared
                }
                Some(TxState::Committed) => {
                    txs.states.insert(tx_id, TxState::Committed);
                    tracing::debug!("Shard {} tx {} already committed", self.shard, tx_id);
                    return Ok(());
                }
                Some(other) => {
                    let reason = match other {
                        TxState::Aborted => "commit after abort",
                        _ => "commit before prepare resolved",
                    };
                    txs.states.insert(tx_id, other);
                    return Err(Error::InvalidTransition {
                        tx_id,
                        reason: reason.into(),
                    });
                }
                None => return Err(Error::UnknownTransaction(tx_id)),
            }
        };

        if &prepared != payload {
            tracing::warn!(
                "Shard {} tx {} commit payload differs from the prepared one, applying prepared",
                self.shard,
                tx_id
            );
        }

        let record = ParticipantRecord::Committed {
            payload: prepared.clone(),
        };
        if let Err(e) = self.log.write(tx_id, &record) {
            self.fail(&e);
            return Err(e);
        }

        self.store.apply(&prepared);
        self.locks.release(&key_set(&prepared));
        tracing::debug!("Shard {} tx {} committed {} keys", self.shard, tx_id, prepared.len());
        Ok(())
    }

    /// Phase two, abort: log the decision and release without applying.
    ///
    /// An abort that arrives while the prepare still waits for locks is
    /// accepted; the keys are released as soon as they are granted. Lock
    /// bookkeeping for keys that were never written is dropped.
    pub fn abort(&self, tx_id: TxId, _payload: &Payload) -> Result<()> {
        self.ensure_running()?;

        let prepared = {
            let mut txs = lock(&self.transactions);
            match txs.states.remove(&tx_id) {
                Some(TxState::Prepared(prepared)) => {
                    txs.decide(tx_id, TxState::Aborted);
                    Some(prepared)
                }
                // Nothing is held yet: the pending prepare or nobody at all.
                Some(TxState::Preparing(_)) | None => {
                    txs.decide(tx_id, TxState::Aborted);
                    None
                }
                Some(TxState::Aborted) => {
                    txs.states.insert(tx_id, TxState::Aborted);
                    return Ok(());
                }
                Some(TxState::Committed) => {
                    txs.states.insert(tx_id, TxState::Committed);
                    return Err(Error::InvalidTransition {
                        tx_id,
                        reason: "abort after commit".into(),
                    });
                }
            }
        };

        if let Err(e) = self.log.write(tx_id, &ParticipantRecord::Aborted) {
            self.fail(&e);
            return Err(e);
        }

        if let Some(prepared) = prepared {
            self.locks
                .release_abort(&key_set(&prepared), |key| self.store.contains(key));
        }
        tracing::debug!("Shard {} tx {} aborted", self.shard, tx_id);
        Ok(())
    }

    /// Current values of the requested keys this shard holds. Takes no key
    /// locks, so a read sees the last applied commit.
    pub fn get(&self, keys: &KeySet) -> Payload {
        self.store.get_many(keys)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    /// Transactions that voted yes and still wait for a decision
    pub fn in_doubt(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = lock(&self.transactions)
            .states
            .iter()
            .filter(|(_, state)| matches!(state, TxState::Prepared(_)))
            .map(|(tx_id, _)| *tx_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Transactions currently remembered, decided or not
    pub fn tracked_transactions(&self) -> usize {
        lock(&self.transactions).states.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Resolves once the participant has halted.
    pub async fn halted(&self) {
        let notified = self.halt.notified();
        if self.is_halted() {
            return;
        }
        notified.await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            Err(Error::NodeHalted)
        } else {
            Ok(())
        }
    }

    fn fail(&self, error: &Error) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "Shard {} halting, decision log is unusable: {}",
                self.shard,
                error
            );
            self.halt.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LogSyncPolicy;
    use crate::shard::lock_manager::KeyState;
    use std::time::Duration;
    use tempfile::TempDir;

    fn payload(entries: &[(u64, &str)]) -> Payload {
        entries
            .iter()
            .map(|(k, v)| (*k, v.as_bytes().to_vec()))
            .collect()
    }

    fn open(dir: &TempDir) -> DecisionLog<ParticipantRecord> {
        DecisionLog::open(dir.path().join("shard-0.log"), LogSyncPolicy::Always).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_commit_applies_and_unlocks() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));
        let data = payload(&[(3, "a"), (6, "b")]);

        p.prepare(1, data.clone()).await.unwrap();
        assert_eq!(p.locks().key_state(3), Some(KeyState { busy: true, waiters: 0 }));
        assert!(p.get(&[3].into_iter().collect()).is_empty());

        p.commit(1, &data).unwrap();
        assert_eq!(p.get(&[3, 6, 9].into_iter().collect()), data);
        assert_eq!(p.locks().key_state(3), Some(KeyState { busy: false, waiters: 0 }));
    }

    #[tokio::test]
    async fn test_abort_discards_and_prunes_locks() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));

        p.prepare(1, payload(&[(3, "old")])).await.unwrap();
        p.commit(1, &payload(&[(3, "old")])).unwrap();

        let data = payload(&[(3, "new"), (6, "never")]);
        p.prepare(2, data.clone()).await.unwrap();
        p.abort(2, &data).unwrap();

        assert_eq!(p.store().get(3), Some(b"old".to_vec()));
        assert_eq!(p.locks().key_state(3), Some(KeyState { busy: false, waiters: 0 }));
        assert_eq!(p.locks().key_state(6), None);
    }

    #[tokio::test]
    async fn test_overlapping_prepare_waits_for_commit() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));

        p.prepare(1, payload(&[(3, "first")])).await.unwrap();

        let second = tokio::spawn({
            let p = p.clone();
            async move { p.prepare(2, payload(&[(3, "second")])).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        p.commit(1, &payload(&[(3, "first")])).unwrap();
        second.await.unwrap().unwrap();
        p.commit(2, &payload(&[(3, "second")])).unwrap();

        assert_eq!(p.store().get(3), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_duplicate_messages_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));
        let data = payload(&[(1, "x")]);

        p.prepare(1, data.clone()).await.unwrap();
        p.prepare(1, data.clone()).await.unwrap();
        assert_eq!(p.locks().key_state(1), Some(KeyState { busy: true, waiters: 0 }));

        p.commit(1, &data).unwrap();
        p.commit(1, &data).unwrap();
        assert_eq!(p.locks().key_state(1), Some(KeyState { busy: false, waiters: 0 }));

        assert!(matches!(p.abort(1, &data), Err(Error::InvalidTransition { .. })));
        assert!(matches!(p.commit(9, &data), Err(Error::UnknownTransaction(9))));
    }

    #[tokio::test]
    async fn test_abort_of_unknown_transaction_is_recorded() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));

        p.abort(4, &payload(&[(1, "x")])).unwrap();
        assert_eq!(p.locks().tracked_keys(), 0);
        assert!(matches!(
            p.prepare(4, payload(&[(1, "x")])).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_replays_commits_and_relocks_in_doubt() {
        let dir = TempDir::new().unwrap();
        {
            let p = Participant::new(0, open(&dir));
            p.prepare(1, payload(&[(3, "a")])).await.unwrap();
            p.commit(1, &payload(&[(3, "a")])).unwrap();
            p.prepare(2, payload(&[(6, "b")])).await.unwrap();
            p.abort(2, &payload(&[(6, "b")])).unwrap();
            p.prepare(3, payload(&[(9, "c")])).await.unwrap();
        }

        let p = Participant::recover(0, open(&dir)).await.unwrap();
        assert_eq!(p.store().get(3), Some(b"a".to_vec()));
        assert_eq!(p.store().get(6), None);
        assert_eq!(p.in_doubt(), vec![3]);
        assert_eq!(p.locks().key_state(9), Some(KeyState { busy: true, waiters: 0 }));

        p.commit(3, &payload(&[(9, "c")])).unwrap();
        assert_eq!(p.store().get(9), Some(b"c".to_vec()));
        // Decisions from before the restart are still recognised.
        p.commit(1, &payload(&[(3, "a")])).unwrap();
        assert!(p.in_doubt().is_empty());
    }

    #[tokio::test]
    async fn test_abort_while_waiting_for_locks() {
        let dir = TempDir::new().unwrap();
        let p = Participant::new(0, open(&dir));
        let late = payload(&[(3, "late"), (6, "late")]);

        p.prepare(1, payload(&[(3, "blocker")])).await.unwrap();
        let waiting = tokio::spawn({
            let p = p.clone();
            let late = late.clone();
            async move { p.prepare(2, late).await }
        });
        while p.locks().key_state(3).map(|s| s.waiters) != Some(1) {
            tokio::task::yield_now().await;
        }

        p.abort(2, &late).unwrap();
        assert!(matches!(p.commit(2, &late), Err(Error::InvalidTransition { .. })));

        p.commit(1, &payload(&[(3, "blocker")])).unwrap();
        assert!(waiting.await.unwrap().is_err());

        assert_eq!(p.store().get(3), Some(b"blocker".to_vec()));
        assert_eq!(p.locks().key_state(3), Some(KeyState { busy: false, waiters: 0 }));
        assert_eq!(p.locks().key_state(6), None);
        assert!(p.in_doubt().is_empty());

        p.prepare(3, payload(&[(3, "next")])).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_keeps_abort_logged_before_vote() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir);
            let prepared = ParticipantRecord::Prepared {
                payload: payload(&[(3, "x")]),
            };
            log.write(5, &ParticipantRecord::Aborted).unwrap();
            log.write(5, &prepared).unwrap();
        }

        let p = Participant::recover(0, open(&dir)).await.unwrap();
        assert!(p.in_doubt().is_empty());
        assert_eq!(p.locks().key_state(3), None);
        p.abort(5, &Payload::new()).unwrap();
    }

    #[tokio::test]
    async fn test_decided_transactions_are_bounded() {
        let dir = TempDir::new().unwrap();
        let p = Participant::with_retention(0, open(&dir), 2);

        for tx_id in 1..=5u64 {
            let data = payload(&[(tx_id, "v")]);
            p.prepare(tx_id, data.clone()).await.unwrap();
            p.commit(tx_id, &data).unwrap();
        }
        assert_eq!(p.tracked_transactions(), 2);
        p.commit(5, &payload(&[(5, "v")])).unwrap();
        assert!(matches!(
            p.commit(1, &payload(&[(1, "v")])),
            Err(Error::UnknownTransaction(1))
        ));

        // Undecided transactions are never forgotten.
        p.prepare(6, payload(&[(6, "w")])).await.unwrap();
        p.abort(7, &Payload::new()).unwrap();
        p.abort(8, &Payload::new()).unwrap();
        assert_eq!(p.tracked_transactions(), 3);
        assert_eq!(p.in_doubt(), vec![6]);
        drop(p);

        let p = Participant::recover_with_retention(0, open(&dir), 2).await.unwrap();
        assert_eq!(p.tracked_transactions(), 3);
        assert_eq!(p.in_doubt(), vec![6]);
        assert_eq!(p.store().len(), 5);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_log_failure_halts_participant() {
        // Every write to /dev/full fails with ENOSPC.
        let log = DecisionLog::open("/dev/full", LogSyncPolicy::Flush).unwrap();
        let p = Participant::new(0, log);

        let err = p.prepare(1, payload(&[(3, "a")])).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(p.is_halted());
        assert_eq!(p.locks().key_state(3), None);

        tokio::time::timeout(Duration::from_secs(1), p.halted())
            .await
            .unwrap();
        assert!(matches!(
            p.prepare(2, payload(&[(4, "b")])).await,
            Err(Error::NodeHalted)
        ));
        assert!(matches!(p.abort(2, &Payload::new()), Err(Error::NodeHalted)));
    }
}
