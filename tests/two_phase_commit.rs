//! Two-phase commit tests against in-process shards

use shardkv::common::config::{ClusterConfig, RouterConfig};
use shardkv::common::{DecisionLog, KeySet, LogSyncPolicy, Payload, Result, ShardId, TxId};
use shardkv::coordinator::{LocalShards, Outcomes, Router, ShardClient};
use shardkv::shard::lock_manager::KeyState;
use shardkv::Participant;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Cluster {
    _dir: TempDir,
    participants: Vec<Arc<Participant>>,
    router: Arc<Router<LocalShards>>,
    outcomes: Outcomes,
}

fn cluster(size: u16) -> Cluster {
    let dir = TempDir::new().unwrap();
    let participants: Vec<Arc<Participant>> = (0..size as u32)
        .map(|shard| {
            let path = dir.path().join(format!("shard-{}.log", shard));
            Participant::new(shard, DecisionLog::open(path, LogSyncPolicy::Always).unwrap())
        })
        .collect();

    let addr = |port| SocketAddr::from(([127, 0, 0, 1], port));
    let layout = ClusterConfig::new((0..size).map(|i| addr(12345 + i)).collect(), addr(12350));
    let config = RouterConfig {
        log_path: None,
        ..Default::default()
    };
    let shards = Arc::new(LocalShards::new(participants.clone()));
    let (router, outcomes) = Router::new(Arc::new(layout), shards, &config, None).unwrap();

    Cluster {
        _dir: dir,
        participants,
        router,
        outcomes,
    }
}

fn payload(pairs: &[(u64, &str)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (*k, v.as_bytes().to_vec()))
        .collect()
}

async fn wait_for_waiters(participant: &Participant, key: u64, waiters: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while participant.locks().key_state(key).map(|s| s.waiters) != Some(waiters) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_three_shard_write() {
    let mut c = cluster(3);

    c.router
        .put(1, 100, payload(&[(3, "a"), (4, "b"), (5, "c")]))
        .unwrap();
    let outcome = c.outcomes.writes.recv().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.client_tx_id, 100);
    assert_eq!(outcome.client, 1);

    assert_eq!(c.participants[0].store().get(3), Some(b"a".to_vec()));
    assert_eq!(c.participants[1].store().get(4), Some(b"b".to_vec()));
    assert_eq!(c.participants[2].store().get(5), Some(b"c".to_vec()));

    // Committed keys stay known and free.
    for (shard, key) in [(0, 3), (1, 4), (2, 5)] {
        assert_eq!(
            c.participants[shard].locks().key_state(key),
            Some(KeyState {
                busy: false,
                waiters: 0
            })
        );
        assert!(c.participants[shard].in_doubt().is_empty());
    }
    assert_eq!(c.router.coordinator().in_flight(), 0);
}

#[tokio::test]
async fn test_overlapping_writes_commit_in_order() {
    let mut c = cluster(3);
    let shard0 = c.participants[0].clone();

    // An outside transaction holds key 3 so both writes must queue behind it.
    shard0.prepare(999, payload(&[(3, "blocker")])).await.unwrap();

    c.router.put(1, 1, payload(&[(3, "first"), (4, "x")])).unwrap();
    wait_for_waiters(&shard0, 3, 1).await;
    c.router.put(2, 2, payload(&[(3, "second")])).unwrap();
    wait_for_waiters(&shard0, 3, 2).await;

    assert!(c.outcomes.writes.try_recv().is_err());

    shard0.abort(999, &payload(&[(3, "blocker")])).unwrap();

    let first = c.outcomes.writes.recv().await.unwrap();
    let second = c.outcomes.writes.recv().await.unwrap();
    assert!(first.success && second.success);
    assert_eq!((first.client_tx_id, second.client_tx_id), (1, 2));

    assert_eq!(shard0.store().get(3), Some(b"second".to_vec()));
    assert_eq!(c.participants[1].store().get(4), Some(b"x".to_vec()));
}

#[tokio::test]
async fn test_disjoint_writes_do_not_wait() {
    let mut c = cluster(3);
    let shard0 = c.participants[0].clone();

    shard0.prepare(999, payload(&[(3, "held")])).await.unwrap();

    c.router.put(1, 1, payload(&[(6, "y"), (4, "z")])).unwrap();
    let outcome = c.outcomes.writes.recv().await.unwrap();
    assert!(outcome.success);
    assert_eq!(shard0.store().get(6), Some(b"y".to_vec()));
    assert_eq!(shard0.locks().key_state(3).map(|s| s.busy), Some(true));

    shard0.commit(999, &payload(&[(3, "held")])).unwrap();
    assert_eq!(shard0.store().get(3), Some(b"held".to_vec()));
}

#[tokio::test]
async fn test_write_then_read() {
    let mut c = cluster(3);

    c.router
        .put(1, 1, payload(&[(10, "ten"), (11, "eleven")]))
        .unwrap();
    assert!(c.outcomes.writes.recv().await.unwrap().success);

    c.router.get(1, 2, [10, 11, 12].into_iter().collect());
    let read = c.outcomes.reads.recv().await.unwrap();
    assert!(read.complete);
    assert_eq!(read.client_tx_id, 2);
    assert_eq!(read.values, payload(&[(10, "ten"), (11, "eleven")]));
}

#[tokio::test]
async fn test_many_concurrent_writes_to_one_key() {
    let mut c = cluster(2);

    for i in 0..20u64 {
        c.router
            .put(i, i, payload(&[(0, "v"), (i * 2 + 1, "w")]))
            .unwrap();
    }

    let mut done = 0;
    while done < 20 {
        assert!(c.outcomes.writes.recv().await.unwrap().success);
        done += 1;
    }

    assert_eq!(c.participants[0].locks().key_state(0).map(|s| s.busy), Some(false));
    assert!(c.participants.iter().all(|p| p.in_doubt().is_empty()));
}

/// In-process shards where chosen writes reach chosen shards late
struct SlowPrepares {
    inner: LocalShards,
    /// (shard, value) pairs whose prepare is delayed
    slow: Vec<(ShardId, &'static [u8])>,
    delay: Duration,
}

impl ShardClient for SlowPrepares {
    async fn prepare(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        let slow = self
            .slow
            .iter()
            .any(|(s, value)| *s == shard && payload.values().any(|v| v.as_slice() == *value));
        if slow {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.prepare(shard, tx_id, payload).await
    }

    async fn commit(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        self.inner.commit(shard, tx_id, payload).await
    }

    async fn abort(&self, shard: ShardId, tx_id: TxId, payload: Payload) -> Result<()> {
        self.inner.abort(shard, tx_id, payload).await
    }

    async fn get(&self, shard: ShardId, tx_id: TxId, keys: KeySet) -> Result<Payload> {
        self.inner.get(shard, tx_id, keys).await
    }
}

#[tokio::test]
async fn test_crossing_writes_with_uneven_latency_both_commit() {
    let dir = TempDir::new().unwrap();
    let participants: Vec<Arc<Participant>> = (0..2)
        .map(|shard| {
            let path = dir.path().join(format!("shard-{}.log", shard));
            Participant::new(shard, DecisionLog::open(path, LogSyncPolicy::Always).unwrap())
        })
        .collect();

    let addr = |port| SocketAddr::from(([127, 0, 0, 1], port));
    let layout = ClusterConfig::new(vec![addr(12345), addr(12346)], addr(12350));
    let config = RouterConfig {
        log_path: None,
        ..Default::default()
    };
    // Write A is slow to reach shard 1, write B is slow to reach shard 0.
    let shards = Arc::new(SlowPrepares {
        inner: LocalShards::new(participants.clone()),
        slow: vec![(1, &b"a"[..]), (0, &b"b"[..])],
        delay: Duration::from_millis(50),
    });
    let (router, mut outcomes) = Router::new(Arc::new(layout), shards, &config, None).unwrap();

    // Keys 2 and 3 live on shards 0 and 1.
    router.put(1, 1, payload(&[(2, "a"), (3, "a")])).unwrap();
    router.put(2, 2, payload(&[(2, "b"), (3, "b")])).unwrap();

    let both = tokio::time::timeout(Duration::from_secs(3), async {
        let first = outcomes.writes.recv().await.unwrap();
        let second = outcomes.writes.recv().await.unwrap();
        (first, second)
    })
    .await
    .expect("crossing writes deadlocked");
    assert!(both.0.success && both.1.success);

    for (shard, key) in [(0, 2), (1, 3)] {
        assert_eq!(participants[shard].locks().key_state(key).map(|s| s.busy), Some(false));
    }
    // Both shards saw the same commit order.
    assert_eq!(participants[0].store().get(2), participants[1].store().get(3));
}
