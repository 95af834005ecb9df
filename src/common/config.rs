//! Configuration for shardkv components
//!
//! One file describes the whole cluster. It is loaded once at startup and
//! passed by value (or behind an `Arc`) to every component; nothing mutates
//! it afterwards.

use crate::common::hash::shard_key;
use crate::common::types::{Key, ShardId};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "shardkv.toml";

/// Environment variable prefix (`SHARDKV__ROUTER__READ_TIMEOUT_MS=500`)
pub const ENV_PREFIX: &str = "SHARDKV";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub shard: ShardConfig,

    #[serde(default)]
    pub router: RouterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Static cluster layout, known identically by every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Shard addresses, indexed by shard id
    #[serde(default = "default_shards")]
    pub shards: Vec<SocketAddr>,

    /// Client-facing router address
    #[serde(default = "default_router_addr")]
    pub router_addr: SocketAddr,
}

fn default_shards() -> Vec<SocketAddr> {
    [12345, 12346, 12347]
        .into_iter()
        .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
        .collect()
}

fn default_router_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 12350))
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            router_addr: default_router_addr(),
        }
    }
}

impl ClusterConfig {
    /// Build a layout from explicit shard addresses
    pub fn new(shards: Vec<SocketAddr>, router_addr: SocketAddr) -> Self {
        Self {
            shards,
            router_addr,
        }
    }

    /// Number of shards (`N` in `key mod N`)
    pub fn size(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Owning shard for a key
    pub fn shard_for(&self, key: Key) -> ShardId {
        shard_key(key, self.size())
    }

    /// Address of a shard
    pub fn shard_addr(&self, shard: ShardId) -> Result<SocketAddr> {
        self.shards
            .get(shard as usize)
            .copied()
            .ok_or(Error::ShardNotFound(shard))
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::InvalidConfig(
                "cluster.shards must list at least one shard".into(),
            ));
        }
        if u32::try_from(self.shards.len()).is_err() {
            return Err(Error::InvalidConfig("too many shards".into()));
        }
        Ok(())
    }
}

/// Sync policy for the decision log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// Flush and fsync every append (durability before acknowledgment)
    #[default]
    Always,
    /// Flush to the OS on every append, no fsync
    Flush,
    /// Leave buffering to the writer (tests and benchmarks only)
    Never,
}

/// Shard node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Directory holding `shard-<id>.log`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub log_sync: LogSyncPolicy,

    /// How many decided transactions a shard remembers for duplicate
    /// commit and abort messages
    #[serde(default = "default_decided_retention")]
    pub decided_retention: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_decided_retention() -> usize {
    crate::shard::participant::DEFAULT_DECIDED_RETENTION
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_sync: LogSyncPolicy::default(),
            decided_retention: default_decided_retention(),
        }
    }
}

impl ShardConfig {
    pub fn log_path(&self, shard: ShardId) -> PathBuf {
        self.data_dir.join(format!("shard-{}.log", shard))
    }
}

/// Router (coordinator + read tracker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Scatter-gather read deadline
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Coordinator decision log; recovery is skipped when unset
    #[serde(default = "default_router_log")]
    pub log_path: Option<PathBuf>,

    #[serde(default)]
    pub log_sync: LogSyncPolicy,

    /// First retry delay for unreachable shards
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,

    /// Backoff ceiling for unreachable shards
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// TCP connect timeout towards shards
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_read_timeout() -> u64 {
    10_000
}
fn default_router_log() -> Option<PathBuf> {
    Some(PathBuf::from("./data/router.log"))
}
fn default_retry_initial() -> u64 {
    50
}
fn default_retry_max() -> u64 {
    5_000
}
fn default_connect_timeout() -> u64 {
    1_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            log_path: default_router_log(),
            log_sync: LogSyncPolicy::default(),
            retry_initial_ms: default_retry_initial(),
            retry_max_ms: default_retry_max(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RouterConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file and `SHARDKV__*` environment
    /// variables. Without an explicit path, `shardkv.toml` is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.shards")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if self.shard.decided_retention == 0 {
            return Err(Error::InvalidConfig(
                "shard.decided_retention must be positive".into(),
            ));
        }
        if self.router.read_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "router.read_timeout_ms must be positive".into(),
            ));
        }
        if self.router.retry_initial_ms > self.router.retry_max_ms {
            return Err(Error::InvalidConfig(
                "router.retry_initial_ms exceeds router.retry_max_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_three_node_layout() {
        let config = Config::default();
        assert_eq!(config.cluster.size(), 3);
        assert_eq!(
            config.cluster.shard_addr(1).unwrap(),
            "127.0.0.1:12346".parse().unwrap()
        );
        assert_eq!(config.router.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.shard.log_sync, LogSyncPolicy::Always);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shard_for_uses_cluster_size() {
        let cluster = ClusterConfig::default();
        assert_eq!(cluster.shard_for(0), 0);
        assert_eq!(cluster.shard_for(4), 1);
        assert_eq!(cluster.shard_for(8), 2);
        assert!(matches!(cluster.shard_addr(3), Err(Error::ShardNotFound(3))));
    }

    #[test]
    fn test_empty_cluster_rejected() {
        let mut config = Config::default();
        config.cluster.shards.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[cluster]
shards = ["127.0.0.1:7001", "127.0.0.1:7002"]
router_addr = "127.0.0.1:7000"

[router]
read_timeout_ms = 250
log_path = "{}"

[shard]
log_sync = "flush"
"#,
            dir.path().join("router.log").display()
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.cluster.size(), 2);
        assert_eq!(config.router.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.shard.log_sync, LogSyncPolicy::Flush);
        assert_eq!(config.router.retry_max_ms, 5_000);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
