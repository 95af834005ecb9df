//! Core identifiers and payload types shared by routers and shards

use std::collections::{BTreeMap, BTreeSet};

/// Key identifier
pub type Key = u64;

/// Opaque value bytes
pub type Value = Vec<u8>;

/// Shard index in `[0, cluster size)`
pub type ShardId = u32;

/// Coordinator-assigned transaction id
pub type TxId = u64;

/// Client-supplied transaction id, echoed back in responses
pub type ClientTxId = u64;

/// Identifies the client connection a response must be delivered to
pub type ClientId = u64;

/// Key → value mapping carried by writes and read results.
///
/// Ordered so that lock acquisition and log records are deterministic.
pub type Payload = BTreeMap<Key, Value>;

/// Ordered key set
pub type KeySet = BTreeSet<Key>;
