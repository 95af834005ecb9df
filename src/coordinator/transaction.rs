//! Two-phase commit transaction state

use crate::common::types::{ClientId, ClientTxId, Payload, ShardId, TxId};
use crate::common::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Preparing,
    Prepared,
    Committing,
    Aborting,
    Committed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Committed | Phase::Aborted)
    }

    /// Allowed transaction-level transitions.
    ///
    /// `Init` may jump straight to a decision when a recovered transaction
    /// already has one in the coordinator log.
    fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Init, Preparing)
                | (Init, Committing)
                | (Init, Aborting)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Prepared, Aborting)
                | (Committing, Committed)
                | (Aborting, Aborted)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Preparing => write!(f, "preparing"),
            Phase::Prepared => write!(f, "prepared"),
            Phase::Committing => write!(f, "committing"),
            Phase::Aborting => write!(f, "aborting"),
            Phase::Committed => write!(f, "committed"),
            Phase::Aborted => write!(f, "aborted"),
        }
    }
}

/// One distributed write, owned by the coordinator for its whole life.
#[derive(Debug, Clone)]
pub struct TwoPcTransaction {
    id: TxId,
    client_tx_id: ClientTxId,
    client: ClientId,
    payloads: BTreeMap<ShardId, Payload>,
    phase: Phase,
    participants: BTreeMap<ShardId, Phase>,
}

impl TwoPcTransaction {
    pub fn new(
        id: TxId,
        client_tx_id: ClientTxId,
        client: ClientId,
        payloads: BTreeMap<ShardId, Payload>,
    ) -> Self {
        let participants = payloads.keys().map(|shard| (*shard, Phase::Init)).collect();
        Self {
            id,
            client_tx_id,
            client,
            payloads,
            phase: Phase::Init,
            participants,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn client_tx_id(&self) -> ClientTxId {
        self.client_tx_id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn payloads(&self) -> &BTreeMap<ShardId, Payload> {
        &self.payloads
    }

    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                tx_id: self.id,
                reason: format!("{} -> {}", self.phase, next),
            });
        }
        tracing::debug!("tx {} {} -> {}", self.id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    pub fn participant_status(&self, shard: ShardId) -> Option<Phase> {
        self.participants.get(&shard).copied()
    }

    pub fn set_participant_status(&mut self, shard: ShardId, phase: Phase) {
        if let Some(status) = self.participants.get_mut(&shard) {
            *status = phase;
        }
    }

    /// True when every participant's status is one of `phases`.
    pub fn all_participants_in(&self, phases: &[Phase]) -> bool {
        self.participants.values().all(|status| phases.contains(status))
    }

    /// Shards whose participant status is `phase`
    pub fn participants_in(&self, phase: Phase) -> Vec<ShardId> {
        self.participants
            .iter()
            .filter(|(_, status)| **status == phase)
            .map(|(shard, _)| *shard)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> TwoPcTransaction {
        let payloads = [
            (0, [(3, b"a".to_vec())].into_iter().collect()),
            (1, [(4, b"b".to_vec())].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        TwoPcTransaction::new(1, 100, 7, payloads)
    }

    #[test]
    fn test_commit_path() {
        let mut t = tx();
        t.advance(Phase::Preparing).unwrap();
        assert!(!t.all_participants_in(&[Phase::Prepared]));

        t.set_participant_status(0, Phase::Prepared);
        t.set_participant_status(1, Phase::Prepared);
        assert!(t.all_participants_in(&[Phase::Prepared, Phase::Committed]));

        t.advance(Phase::Prepared).unwrap();
        t.advance(Phase::Committing).unwrap();
        t.advance(Phase::Committed).unwrap();
        assert!(t.phase().is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = tx();
        assert!(t.advance(Phase::Committed).is_err());
        t.advance(Phase::Preparing).unwrap();
        assert!(t.advance(Phase::Committing).is_err());
        t.advance(Phase::Aborting).unwrap();
        assert!(t.advance(Phase::Committed).is_err());
        t.advance(Phase::Aborted).unwrap();
        assert!(t.advance(Phase::Preparing).is_err());
    }

    #[test]
    fn test_participants_in() {
        let mut t = tx();
        t.set_participant_status(1, Phase::Prepared);
        t.set_participant_status(9, Phase::Prepared);
        assert_eq!(t.participants_in(Phase::Prepared), vec![1]);
        assert_eq!(t.participant_status(0), Some(Phase::Init));
        assert_eq!(t.participant_status(9), None);
    }
}
