//! Client request routing
//!
//! Puts are split by owning shard and handed to the 2PC coordinator; gets are
//! split the same way and fanned out as a scatter-gather read. Results come
//! back asynchronously on the channels in [`Outcomes`].

use crate::common::config::{ClusterConfig, RouterConfig};
use crate::common::decision_log::DecisionLog;
use crate::common::protocol::ClientRequest;
use crate::common::types::{ClientId, ClientTxId, KeySet, Payload, TxId};
use crate::common::{partition_keys, partition_payload, Backoff, Result};
use crate::coordinator::reads::{ReadId, ReadOutcome, ReadTracker};
use crate::coordinator::shard_client::ShardClient;
use crate::coordinator::two_phase::{Coordinator, CoordinatorRecord, WriteOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiving ends for completed writes and reads
pub struct Outcomes {
    pub writes: mpsc::UnboundedReceiver<WriteOutcome>,
    pub reads: mpsc::UnboundedReceiver<ReadOutcome>,
}

pub struct Router<C> {
    cluster: Arc<ClusterConfig>,
    shards: Arc<C>,
    coordinator: Arc<Coordinator<C>>,
    reads: Arc<ReadTracker>,
}

impl<C: ShardClient> Router<C> {
    /// Must be called inside a tokio runtime. Fails if the cluster layout
    /// is unusable, such as one with no shards.
    pub fn new(
        cluster: Arc<ClusterConfig>,
        shards: Arc<C>,
        config: &RouterConfig,
        log: Option<DecisionLog<CoordinatorRecord>>,
    ) -> Result<(Arc<Self>, Outcomes)> {
        cluster.validate()?;

        let (write_tx, writes) = mpsc::unbounded_channel();
        let (read_tx, reads) = mpsc::unbounded_channel();

        let backoff = Backoff {
            initial: config.retry_initial(),
            max: config.retry_max(),
        };
        let coordinator = Coordinator::new(shards.clone(), write_tx, log, backoff);
        let tracker = ReadTracker::new(config.read_timeout(), read_tx);

        let router = Arc::new(Self {
            cluster,
            shards,
            coordinator,
            reads: tracker,
        });
        Ok((router, Outcomes { writes, reads }))
    }

    /// Start a distributed write of `values`.
    pub fn put(
        &self,
        client: ClientId,
        client_tx_id: ClientTxId,
        values: Payload,
    ) -> Result<TxId> {
        let payloads = partition_payload(values, self.cluster.size());
        tracing::debug!(
            "Put {} from client {} spans shards {:?}",
            client_tx_id,
            client,
            payloads.keys().collect::<Vec<_>>()
        );
        self.coordinator.init_process(client_tx_id, client, payloads)
    }

    /// Start a scatter-gather read of `keys`.
    pub fn get(&self, client: ClientId, client_tx_id: ClientTxId, keys: KeySet) -> ReadId {
        let by_shard = partition_keys(keys, self.cluster.size());
        let read_id = self
            .reads
            .begin(client_tx_id, client, by_shard.keys().copied().collect());

        let timeout = self.reads.timeout();
        for (shard, keys) in by_shard {
            let shards = self.shards.clone();
            let reads = self.reads.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, shards.get(shard, read_id, keys)).await {
                    Ok(Ok(values)) => reads.on_response(read_id, shard, values),
                    Ok(Err(e)) => {
                        tracing::warn!("Read {} on shard {} failed: {}", read_id, shard, e)
                    }
                    Err(_) => tracing::debug!("Read {} on shard {} gave up", read_id, shard),
                }
            });
        }

        read_id
    }

    /// Dispatch one client request.
    pub fn handle(&self, client: ClientId, request: ClientRequest) -> Result<()> {
        match request {
            ClientRequest::Put {
                client_tx_id,
                values,
            } => self.put(client, client_tx_id, values).map(|_| ()),
            ClientRequest::Get { client_tx_id, keys } => {
                self.get(client, client_tx_id, keys);
                Ok(())
            }
        }
    }

    /// Re-drive writes left unfinished by a previous run.
    pub fn recover(&self) -> Result<usize> {
        self.coordinator.recover()
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<C>> {
        &self.coordinator
    }

    pub fn reads(&self) -> &Arc<ReadTracker> {
        &self.reads
    }

    pub fn read_timeout(&self) -> Duration {
        self.reads.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ShardId;
    use crate::common::utils::lock;
    use crate::common::Error;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Shards backed by a plain map; shard 2 optionally never answers reads.
    #[derive(Default)]
    struct MapShards {
        data: Mutex<BTreeMap<u64, Vec<u8>>>,
        silent: Option<ShardId>,
    }

    impl ShardClient for MapShards {
        async fn prepare(&self, _shard: ShardId, _tx_id: TxId, _payload: Payload) -> Result<()> {
            Ok(())
        }

        async fn commit(&self, _shard: ShardId, _tx_id: TxId, payload: Payload) -> Result<()> {
            lock(&self.data).extend(payload);
            Ok(())
        }

        async fn abort(&self, _shard: ShardId, _tx_id: TxId, _payload: Payload) -> Result<()> {
            Ok(())
        }

        async fn get(&self, shard: ShardId, _tx_id: TxId, keys: KeySet) -> Result<Payload> {
            if self.silent == Some(shard) {
                std::future::pending::<()>().await;
                return Err(Error::Timeout("unreachable".into()));
            }
            let data = lock(&self.data);
            Ok(keys
                .iter()
                .filter_map(|k| data.get(k).map(|v| (*k, v.clone())))
                .collect())
        }
    }

    fn cluster() -> Arc<ClusterConfig> {
        let addr = |port| SocketAddr::from(([127, 0, 0, 1], port));
        Arc::new(ClusterConfig::new(
            vec![addr(12345), addr(12346), addr(12347)],
            addr(12350),
        ))
    }

    fn router(shards: MapShards) -> (Arc<Router<MapShards>>, Outcomes) {
        let config = RouterConfig {
            log_path: None,
            ..Default::default()
        };
        Router::new(cluster(), Arc::new(shards), &config, None).unwrap()
    }

    fn payload(pairs: &[(u64, &str)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (*k, v.as_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (router, mut outcomes) = router(MapShards::default());

        router
            .handle(
                1,
                ClientRequest::Put {
                    client_tx_id: 10,
                    values: payload(&[(3, "a"), (4, "b"), (5, "c")]),
                },
            )
            .unwrap();
        let write = outcomes.writes.recv().await.unwrap();
        assert!(write.success);
        assert_eq!(write.client_tx_id, 10);

        router
            .handle(
                1,
                ClientRequest::Get {
                    client_tx_id: 11,
                    keys: [3, 4, 5, 6].into_iter().collect(),
                },
            )
            .unwrap();
        let read = outcomes.reads.recv().await.unwrap();
        assert!(read.complete);
        assert_eq!(read.values, payload(&[(3, "a"), (4, "b"), (5, "c")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_shard_yields_partial_read() {
        let shards = MapShards {
            silent: Some(2),
            ..Default::default()
        };
        lock(&shards.data).extend(payload(&[(3, "a"), (4, "b"), (5, "c")]));
        let (router, mut outcomes) = router(shards);

        router.get(1, 20, [3, 4, 5].into_iter().collect());
        let read = outcomes.reads.recv().await.unwrap();

        assert!(!read.complete);
        assert_eq!(read.client_tx_id, 20);
        assert_eq!(read.values, payload(&[(3, "a"), (4, "b")]));
        assert_eq!(router.reads().pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_cluster_is_refused() {
        let empty = Arc::new(ClusterConfig::new(
            Vec::new(),
            SocketAddr::from(([127, 0, 0, 1], 12350)),
        ));
        let result = Router::new(
            empty,
            Arc::new(MapShards::default()),
            &RouterConfig::default(),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
