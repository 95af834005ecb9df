//! Router → shard calls
//!
//! [`ShardClient`] is the seam between the coordination core and the network:
//! the coordinator and the read path only ever talk to shards through it.

use crate::common::config::ClusterConfig;
use crate::common::protocol::{ShardRequest, ShardResponse};
use crate::common::transport::{connect, read_frame, write_frame};
use crate::common::types::{KeySet, Payload, ShardId, TxId};
use crate::common::{Error, Result};
use crate::shard::Participant;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// The four participant operations as seen from the router.
///
/// A retryable error means the shard could not be reached; any other error
/// is a failure reported by the participant itself.
pub trait ShardClient: Send + Sync + 'static {
    fn prepare(
        &self,
        shard: ShardId,
        tx_id: TxId,
        payload: Payload,
    ) -> impl Future<Output = Result<()>> + Send;

    fn commit(
        &self,
        shard: ShardId,
        tx_id: TxId,
        payload: Payload,
    ) -> impl Future<Output = Result<()>> + Send;

    fn abort(
        &self,
        shard: ShardId,
        tx_id: TxId,
        payload: Payload,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get(
        &self,
        shard: ShardId,
        tx_id: TxId,
        keys: KeySet,
    ) -> impl Future<Output = Result<Payload>> + Send;
}

/// Shards reached over TCP, one connection per request.
///
/// Prepares can wait on key locks for an unbounded time, so requests never
/// share a connection.
pub struct RemoteShards {
    cluster: Arc<ClusterConfig>,
    connect_timeout: Duration,
}

impl RemoteShards {
    pub fn new(cluster: Arc<ClusterConfig>, connect_timeout: Duration) -> Self {
        Self {
            cluster,
            connect_timeout,
        }
    }

    async fn call(&self, shard: ShardId, request: ShardRequest) -> Result<ShardResponse> {
        let addr = self.cluster.shard_addr(shard)?;
        let mut stream = connect(addr, self.connect_timeout).await?;

        write_frame(&mut stream, &request).await?;
        match read_frame::<_, ShardResponse>(&mut stream).await? {
            Some(ShardResponse::Error { message, fatal }) => {
                if fatal {
                    tracing::error!("Shard {} halted: {}", shard, message);
                }
                Err(Error::ParticipantFailed {
                    shard,
                    reason: message,
                })
            }
            Some(response) => Ok(response),
            None => Err(Error::ConnectionFailed(format!(
                "shard {} closed the connection",
                shard
            ))),
        }
    }

    fn unexpected(shard: ShardId, response: ShardResponse) -> Error {
        Error::Protocol(format!("unexpected reply from shard {}: {:?}", shard, response))
    }
}

impl ShardClient for RemoteShards {
    async fn prepare(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        match self.call(shard, ShardRequest::Prepare { tx_id, payload }).await? {
            ShardResponse::Prepared { tx_id: acked } if acked == tx_id => Ok(()),
            other => Err(Self::unexpected(shard, other)),
        }
    }

    async fn commit(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        match self.call(shard, ShardRequest::Commit { tx_id, payload }).await? {
            ShardResponse::Committed { tx_id: acked } if acked == tx_id => Ok(()),
            other => Err(Self::unexpected(shard, other)),
        }
    }

    async fn abort(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        match self.call(shard, ShardRequest::Abort { tx_id, payload }).await? {
            ShardResponse::Aborted { tx_id: acked } if acked == tx_id => Ok(()),
            other => Err(Self::unexpected(shard, other)),
        }
    }

    async fn get(&self, shard: ShardId, tx_id: TxId, keys: KeySet) -> Result<Payload> {
        match self.call(shard, ShardRequest::Get { tx_id, shard, keys }).await? {
            ShardResponse::Values { values, .. } => Ok(values),
            other => Err(Self::unexpected(shard, other)),
        }
    }
}

/// Participants living in the same process, indexed by shard id.
///
/// Used for single-process deployments and tests.
pub struct LocalShards {
    participants: Vec<Arc<Participant>>,
}

impl LocalShards {
    pub fn new(participants: Vec<Arc<Participant>>) -> Self {
        Self { participants }
    }

    pub fn participant(&self, shard: ShardId) -> Result<&Arc<Participant>> {
        self.participants
            .get(shard as usize)
            .ok_or(Error::ShardNotFound(shard))
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn reported(shard: ShardId, error: Error) -> Error {
        if error.is_retryable() {
            error
        } else {
            Error::ParticipantFailed {
                shard,
                reason: error.to_string(),
            }
        }
    }
}

impl ShardClient for LocalShards {
    async fn prepare(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        let participant = self.participant(shard)?;
        participant
            .prepare(tx_id, payload)
            .await
            .map_err(|e| Self::reported(shard, e))
    }

    async fn commit(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        self.participant(shard)?
            .commit(tx_id, &payload)
            .map_err(|e| Self::reported(shard, e))
    }

    async fn abort(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        self.participant(shard)?
            .abort(tx_id, &payload)
            .map_err(|e| Self::reported(shard, e))
    }

    async fn get(&self, shard: ShardId, _tx_id: TxId, keys: KeySet) -> Result<Payload> {
        Ok(self.participant(shard)?.get(&keys))
    }
}
