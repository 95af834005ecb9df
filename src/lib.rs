//! # shardkv
//!
//! A sharded in-memory key-value store with:
//! - Atomic multi-key writes via two-phase commit
//! - Per-key FIFO locking on every shard
//! - Scatter-gather reads with a bounded wait
//! - Durable decision logs on shards and router
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!          clients (put / get)
//!                 │ TCP
//! ┌───────────────▼─────────────────────┐
//! │               Router                │
//! │  - 2PC coordinator (+ decision log) │
//! │  - scatter-gather read tracker      │
//! └───────┬─────────────┬──────────┬────┘
//!         │ TCP         │          │
//! ┌───────▼────┐ ┌──────▼─────┐ ┌──▼─────────┐
//! │  Shard 0   │ │  Shard 1   │ │  Shard 2   │
//! │ key%3 == 0 │ │ key%3 == 1 │ │ key%3 == 2 │
//! │ locks + log│ │ locks + log│ │ locks + log│
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the shards
//! ```bash
//! shardkv-shard 0 --config shardkv.toml
//! shardkv-shard 1 --config shardkv.toml
//! shardkv-shard 2 --config shardkv.toml
//! ```
//!
//! ### Start the router
//! ```bash
//! shardkv-router --config shardkv.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! shardkv put 3=a 4=b 5=c
//! shardkv get 3 4 5
//! ```

pub mod common;
pub mod coordinator;
pub mod shard;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Router, RouterServer};
pub use shard::{Participant, ShardServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
