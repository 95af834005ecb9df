//! Sharding for partitioning the keyspace
//!
//! Every key maps to exactly one shard via `key mod cluster_size`. The mapping
//! is static: cluster membership never changes while a node runs.

use crate::common::types::{Key, KeySet, Payload, ShardId};
use std::collections::BTreeMap;

/// Compute shard ID for a key
pub fn shard_key(key: Key, num_shards: u32) -> ShardId {
    (key % u64::from(num_shards)) as ShardId
}

/// Split a write payload into one sub-payload per owning shard.
///
/// Shards that own none of the keys are absent from the result.
pub fn partition_payload(payload: Payload, num_shards: u32) -> BTreeMap<ShardId, Payload> {
    let mut by_shard: BTreeMap<ShardId, Payload> = BTreeMap::new();
    for (key, value) in payload {
        by_shard
            .entry(shard_key(key, num_shards))
            .or_default()
            .insert(key, value);
    }
    by_shard
}

/// Split a key set into one sub-set per owning shard.
pub fn partition_keys<I>(keys: I, num_shards: u32) -> BTreeMap<ShardId, KeySet>
where
    I: IntoIterator<Item = Key>,
{
    let mut by_shard: BTreeMap<ShardId, KeySet> = BTreeMap::new();
    for key in keys {
        by_shard
            .entry(shard_key(key, num_shards))
            .or_default()
            .insert(key);
    }
    by_shard
}
