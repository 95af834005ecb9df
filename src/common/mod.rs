//! Common utilities and types shared across shardkv

pub mod config;
pub mod decision_log;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod utils;

pub use config::{ClusterConfig, Config, LogSyncPolicy, RouterConfig, ShardConfig};
pub use decision_log::{DecisionLog, LogEntry};
pub use error::{Error, Result};
pub use hash::{partition_keys, partition_payload, shard_key};
pub use types::{ClientId, ClientTxId, Key, KeySet, Payload, ShardId, TxId, Value};
pub use utils::{crc32, retry_with_backoff, timestamp_now_micros, Backoff};
