//! Two-phase commit driver
//!
//! One task per write transaction:
//! 1. Prepare is sent to every shard owning a written key, one shard at a
//!    time in ascending shard id.
//! 2. Once every prepare has resolved, the decision is logged and broadcast.
//! 3. The client is notified exactly once through the outcome channel.
//!
//! There is no prepare timeout. An unreachable shard is retried with capped
//! backoff and a contended key simply keeps its prepare queued, so a write
//! stays pending until every shard's locks become available and then commits.
//! Only a participant that reports failure, or a reply that cannot be
//! understood, leads to an abort.

use crate::common::decision_log::DecisionLog;
use crate::common::types::{ClientId, ClientTxId, Payload, ShardId, TxId};
use crate::common::utils::lock;
use crate::common::{retry_with_backoff, timestamp_now_micros, Backoff, Error, Result};
use crate::coordinator::shard_client::ShardClient;
use crate::coordinator::transaction::{Phase, TwoPcTransaction};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Completion of one write, delivered exactly once per transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub tx_id: TxId,
    pub client_tx_id: ClientTxId,
    pub client: ClientId,
    pub success: bool,
}

/// What the coordinator writes to its decision log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorRecord {
    Begun {
        client_tx_id: ClientTxId,
        client: ClientId,
        payloads: BTreeMap<ShardId, Payload>,
    },
    Committed,
    Aborted,
    /// Every participant acknowledged the decision
    Finished,
}

type SharedTransaction = Arc<Mutex<TwoPcTransaction>>;

pub struct Coordinator<C> {
    shards: Arc<C>,
    transactions: Mutex<HashMap<TxId, SharedTransaction>>,
    next_tx_id: AtomicU64,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
    log: Option<DecisionLog<CoordinatorRecord>>,
    backoff: Backoff,
    halted: AtomicBool,
}

impl<C: ShardClient> Coordinator<C> {
    /// Create a coordinator. Without a log, transactions in flight are lost
    /// when the process stops.
    pub fn new(
        shards: Arc<C>,
        outcomes: mpsc::UnboundedSender<WriteOutcome>,
        log: Option<DecisionLog<CoordinatorRecord>>,
        backoff: Backoff,
    ) -> Arc<Self> {
        Arc::new(Self {
            shards,
            transactions: Mutex::new(HashMap::new()),
            // Time-seeded so ids stay unique across restarts without a log.
            next_tx_id: AtomicU64::new(timestamp_now_micros().max(1)),
            outcomes,
            log,
            backoff,
            halted: AtomicBool::new(false),
        })
    }

    /// Start a 2PC instance for a write already split by shard.
    ///
    /// Returns the coordinator transaction id; the result arrives later as a
    /// [`WriteOutcome`].
    pub fn init_process(
        self: &Arc<Self>,
        client_tx_id: ClientTxId,
        client: ClientId,
        payloads: BTreeMap<ShardId, Payload>,
    ) -> Result<TxId> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::NodeHalted);
        }

        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);

        if payloads.values().all(|payload| payload.is_empty()) {
            tracing::debug!("tx {} has no keys, completing immediately", tx_id);
            self.notify(WriteOutcome {
                tx_id,
                client_tx_id,
                client,
                success: true,
            });
            return Ok(tx_id);
        }

        let record = CoordinatorRecord::Begun {
            client_tx_id,
            client,
            payloads: payloads.clone(),
        };
        self.log_record(tx_id, &record)?;

        let tx = Arc::new(Mutex::new(TwoPcTransaction::new(
            tx_id,
            client_tx_id,
            client,
            payloads,
        )));
        lock(&self.transactions).insert(tx_id, tx.clone());

        tracing::debug!("tx {} started for client tx {}", tx_id, client_tx_id);
        tokio::spawn(Arc::clone(self).drive(tx, None));
        Ok(tx_id)
    }

    /// Re-drive every transaction the coordinator log shows as unfinished.
    ///
    /// Undecided transactions restart from prepare (participants treat a
    /// repeated prepare as a no-op), decided ones re-broadcast the decision.
    /// Returns the number of transactions resumed.
    pub fn recover(self: &Arc<Self>) -> Result<usize> {
        let Some(log) = &self.log else {
            return Ok(0);
        };

        let mut pending: BTreeMap<TxId, (TwoPcTransaction, Option<bool>)> = BTreeMap::new();
        let mut max_tx_id = 0;

        for entry in log.read_all()? {
            max_tx_id = max_tx_id.max(entry.tx_id);
            match entry.record {
                CoordinatorRecord::Begun {
                    client_tx_id,
                    client,
                    payloads,
                } => {
                    let tx = TwoPcTransaction::new(entry.tx_id, client_tx_id, client, payloads);
                    pending.insert(entry.tx_id, (tx, None));
                }
                CoordinatorRecord::Committed => {
                    if let Some((_, decision)) = pending.get_mut(&entry.tx_id) {
                        *decision = Some(true);
                    }
                }
                CoordinatorRecord::Aborted => {
                    if let Some((_, decision)) = pending.get_mut(&entry.tx_id) {
                        *decision = Some(false);
                    }
                }
                CoordinatorRecord::Finished => {
                    pending.remove(&entry.tx_id);
                }
            }
        }

        self.next_tx_id.fetch_max(max_tx_id + 1, Ordering::SeqCst);

        let resumed = pending.len();
        for (tx_id, (tx, decision)) in pending {
            tracing::info!(
                "Resuming tx {} ({})",
                tx_id,
                match decision {
                    Some(true) => "commit",
                    Some(false) => "abort",
                    None => "undecided",
                }
            );
            let tx = Arc::new(Mutex::new(tx));
            lock(&self.transactions).insert(tx_id, tx.clone());
            tokio::spawn(Arc::clone(self).drive(tx, decision));
        }

        Ok(resumed)
    }

    async fn drive(self: Arc<Self>, tx: SharedTransaction, decision: Option<bool>) {
        let tx_id = lock(&tx).id();
        if let Err(e) = self.run(&tx, decision).await {
            // Only a coordinator log failure gets here; the decision is not
            // durable so participants are left in doubt.
            tracing::error!("tx {} abandoned: {}", tx_id, e);
            lock(&self.transactions).remove(&tx_id);
            return;
        }

        let outcome = {
            let tx = lock(&tx);
            WriteOutcome {
                tx_id,
                client_tx_id: tx.client_tx_id(),
                client: tx.client(),
                success: tx.phase() == Phase::Committed,
            }
        };

        if let Err(e) = self.log_record(tx_id, &CoordinatorRecord::Finished) {
            tracing::warn!("tx {} finished but not recorded: {}", tx_id, e);
        }
        lock(&self.transactions).remove(&tx_id);

        tracing::info!(
            "tx {} {} (client tx {})",
            tx_id,
            if outcome.success { "committed" } else { "aborted" },
            outcome.client_tx_id
        );
        self.notify(outcome);
    }

    async fn run(&self, tx: &SharedTransaction, decision: Option<bool>) -> Result<()> {
        let commit = match decision {
            Some(commit) => {
                // A logged decision means every prepare was answered.
                let mut tx = lock(tx);
                let shards: Vec<ShardId> = tx.payloads().keys().copied().collect();
                for shard in shards {
                    tx.set_participant_status(shard, Phase::Prepared);
                }
                commit
            }
            None => {
                lock(tx).advance(Phase::Preparing)?;
                let commit = self.prepare_all(tx).await;
                lock(tx).advance(if commit { Phase::Prepared } else { Phase::Aborting })?;
                let tx_id = lock(tx).id();
                let record = if commit {
                    CoordinatorRecord::Committed
                } else {
                    CoordinatorRecord::Aborted
                };
                self.log_record(tx_id, &record)?;
                commit
            }
        };

        if commit {
            lock(tx).advance(Phase::Committing)?;
            self.broadcast(tx, true).await;
            lock(tx).advance(Phase::Committed)?;
        } else {
            if lock(tx).phase() == Phase::Init {
                lock(tx).advance(Phase::Aborting)?;
            }
            self.broadcast(tx, false).await;
            lock(tx).advance(Phase::Aborted)?;
        }
        Ok(())
    }

    /// Phase one. Prepares go out one shard at a time in ascending shard id,
    /// each awaited before the next, so every transaction acquires locks in
    /// the same global (shard, key) order. Stops at the first refusal; true
    /// means all shards voted yes.
    async fn prepare_all(&self, tx: &SharedTransaction) -> bool {
        let (tx_id, payloads) = {
            let tx = lock(tx);
            (tx.id(), tx.payloads().clone())
        };

        for (shard, payload) in payloads {
            lock(tx).set_participant_status(shard, Phase::Preparing);
            let result = retry_with_backoff(
                || self.shards.prepare(shard, tx_id, payload.clone()),
                None,
                self.backoff,
            )
            .await;

            match result {
                Ok(()) => lock(tx).set_participant_status(shard, Phase::Prepared),
                Err(e @ Error::ParticipantFailed { .. }) => {
                    tracing::warn!("tx {} prepare refused by shard {}: {}", tx_id, shard, e);
                    lock(tx).set_participant_status(shard, Phase::Aborted);
                    return false;
                }
                Err(e) => {
                    // The shard may still be queued on its locks; it stays
                    // `Preparing` so the abort reaches it.
                    tracing::warn!("tx {} prepare on shard {} failed: {}", tx_id, shard, e);
                    return false;
                }
            }
        }

        lock(tx).all_participants_in(&[Phase::Prepared])
    }

    /// Phase two. Commit goes to every shard. Abort goes to every shard that
    /// was asked to prepare and did not refuse; the others hold nothing.
    async fn broadcast(&self, tx: &SharedTransaction, commit: bool) {
        let (tx_id, targets) = {
            let tx = lock(tx);
            let mut shards = tx.participants_in(Phase::Prepared);
            if !commit {
                shards.extend(tx.participants_in(Phase::Preparing));
            }
            let targets: Vec<(ShardId, Payload)> = shards
                .into_iter()
                .filter_map(|shard| tx.payloads().get(&shard).map(|p| (shard, p.clone())))
                .collect();
            (tx.id(), targets)
        };

        let calls = targets.into_iter().map(|(shard, payload)| async move {
            let result = retry_with_backoff(
                || {
                    let payload = payload.clone();
                    async move {
                        if commit {
                            self.shards.commit(shard, tx_id, payload).await
                        } else {
                            self.shards.abort(shard, tx_id, payload).await
                        }
                    }
                },
                None,
                self.backoff,
            )
            .await;

            match result {
                Ok(()) => {
                    let status = if commit { Phase::Committed } else { Phase::Aborted };
                    lock(tx).set_participant_status(shard, status);
                }
                Err(e) => tracing::error!(
                    "tx {} {} on shard {} failed: {}",
                    tx_id,
                    if commit { "commit" } else { "abort" },
                    shard,
                    e
                ),
            }
        });

        join_all(calls).await;
    }

    fn log_record(&self, tx_id: TxId, record: &CoordinatorRecord) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        if let Err(e) = log.write(tx_id, record) {
            if !self.halted.swap(true, Ordering::SeqCst) {
                tracing::error!("Coordinator halting, decision log is unusable: {}", e);
            }
            return Err(e);
        }
        Ok(())
    }

    fn notify(&self, outcome: WriteOutcome) {
        if self.outcomes.send(outcome).is_err() {
            tracing::debug!("Write outcome dropped, no listener");
        }
    }

    /// Number of transactions not yet finished
    pub fn in_flight(&self) -> usize {
        lock(&self.transactions).len()
    }

    /// Current phase of an in-flight transaction
    pub fn phase(&self, tx_id: TxId) -> Option<Phase> {
        let tx = lock(&self.transactions).get(&tx_id).cloned()?;
        let phase = lock(&tx).phase();
        Some(phase)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}
