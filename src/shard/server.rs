//! Shard server

use crate::common::decision_log::DecisionLog;
use crate::common::protocol::{ShardRequest, ShardResponse};
use crate::common::transport::{read_frame, write_frame};
use crate::common::types::ShardId;
use crate::common::{Config, Error, Result};
use crate::shard::participant::Participant;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub struct ShardServer {
    shard: ShardId,
    participant: Arc<Participant>,
    listener: TcpListener,
}

impl ShardServer {
    /// Recover the shard's participant from its decision log and bind the
    /// address the cluster config assigns to it.
    pub async fn open(config: &Config, shard: ShardId) -> Result<Self> {
        let addr = config.cluster.shard_addr(shard)?;
        let log_path = config.shard.log_path(shard);

        tracing::info!("Starting shard server: {}", shard);
        tracing::info!("  Listen: {}", addr);
        tracing::info!("  Decision log: {}", log_path.display());
        tracing::info!("  Cluster size: {}", config.cluster.size());

        let log = DecisionLog::open(&log_path, config.shard.log_sync)?;
        let retention = config.shard.decided_retention;
        let participant = Participant::recover_with_retention(shard, log, retention).await?;
        Self::bind(addr, participant).await
    }

    pub async fn bind(addr: SocketAddr, participant: Arc<Participant>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            shard: participant.shard(),
            participant,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn participant(&self) -> Arc<Participant> {
        self.participant.clone()
    }

    /// Accept router connections until the participant halts.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("✓ Shard {} ready on {}", self.shard, self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Shard {} accept failed: {}", self.shard, e);
                            continue;
                        }
                    };
                    let participant = self.participant.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(participant, stream).await {
                            tracing::debug!("Connection from {} closed: {}", peer, e);
                        }
                    });
                }
                _ = self.participant.halted() => {
                    tracing::error!("Shard {} stopped accepting transactions", self.shard);
                    return Err(Error::NodeHalted);
                }
            }
        }
    }
}

async fn handle_connection(participant: Arc<Participant>, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, ShardRequest>(&mut stream).await? {
        let response = dispatch(&participant, request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// Run one request against the participant and build its reply.
pub async fn dispatch(participant: &Arc<Participant>, request: ShardRequest) -> ShardResponse {
    let tx_id = request.tx_id();
    let kind = request.kind();

    let result = match request {
        ShardRequest::Prepare { tx_id, payload } => participant
            .prepare(tx_id, payload)
            .await
            .map(|_| ShardResponse::Prepared { tx_id }),
        ShardRequest::Commit { tx_id, payload } => participant
            .commit(tx_id, &payload)
            .map(|_| ShardResponse::Committed { tx_id }),
        ShardRequest::Abort { tx_id, payload } => participant
            .abort(tx_id, &payload)
            .map(|_| ShardResponse::Aborted { tx_id }),
        ShardRequest::Get { tx_id, shard, keys } => Ok(ShardResponse::Values {
            tx_id,
            shard,
            values: participant.get(&keys),
        }),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(
            "Shard {} {} for tx {} failed: {}",
            participant.shard(),
            kind,
            tx_id,
            e
        );
        ShardResponse::Error {
            message: e.to_string(),
            fatal: e.is_fatal(),
        }
    })
}
