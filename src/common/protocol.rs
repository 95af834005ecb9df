//! Wire messages between clients, the router and shard nodes
//!
//! Router ↔ shard traffic is strictly request/response on one connection.
//! Client ↔ router traffic is full duplex: responses are matched to requests
//! by the client transaction id and may arrive out of order.

use crate::common::types::{ClientTxId, KeySet, Payload, ShardId, TxId};
use serde::{Deserialize, Serialize};

/// Router → shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRequest {
    /// Lock every key of the payload; the reply is the implicit yes vote
    Prepare { tx_id: TxId, payload: Payload },
    Commit { tx_id: TxId, payload: Payload },
    Abort { tx_id: TxId, payload: Payload },
    /// Unlocked read of the keys this shard owns
    Get {
        tx_id: TxId,
        shard: ShardId,
        keys: KeySet,
    },
}

impl ShardRequest {
    pub fn tx_id(&self) -> TxId {
        match self {
            ShardRequest::Prepare { tx_id, .. }
            | ShardRequest::Commit { tx_id, .. }
            | ShardRequest::Abort { tx_id, .. }
            | ShardRequest::Get { tx_id, .. } => *tx_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ShardRequest::Prepare { .. } => "prepare",
            ShardRequest::Commit { .. } => "commit",
            ShardRequest::Abort { .. } => "abort",
            ShardRequest::Get { .. } => "get",
        }
    }
}

/// Shard → router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardResponse {
    Prepared { tx_id: TxId },
    Committed { tx_id: TxId },
    Aborted { tx_id: TxId },
    Values {
        tx_id: TxId,
        shard: ShardId,
        values: Payload,
    },
    /// The participant refused the request; `fatal` means the node halted
    Error { message: String, fatal: bool },
}

/// Client → router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Put {
        client_tx_id: ClientTxId,
        values: Payload,
    },
    Get {
        client_tx_id: ClientTxId,
        keys: KeySet,
    },
}

/// Router → client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    Put {
        success: bool,
        client_tx_id: ClientTxId,
    },
    /// Possibly partial when a shard missed the read deadline
    Get {
        client_tx_id: ClientTxId,
        values: Payload,
    },
}

impl ClientResponse {
    pub fn client_tx_id(&self) -> ClientTxId {
        match self {
            ClientResponse::Put { client_tx_id, .. } | ClientResponse::Get { client_tx_id, .. } => {
                *client_tx_id
            }
        }
    }
}
