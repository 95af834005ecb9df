//! Router-side coordination
//!
//! The router is responsible for:
//! - Partitioning client writes and reads by shard (`key mod N`)
//! - Driving one two-phase commit per write
//! - Scatter-gather reads with a shared deadline
//! - Recovering unfinished writes from its decision log

pub mod deadline;
pub mod reads;
pub mod router;
pub mod server;
pub mod shard_client;
pub mod transaction;
pub mod two_phase;

pub use reads::{ReadOutcome, ReadTracker};
pub use router::{Outcomes, Router};
pub use server::RouterServer;
pub use shard_client::{LocalShards, RemoteShards, ShardClient};
pub use transaction::{Phase, TwoPcTransaction};
pub use two_phase::{Coordinator, CoordinatorRecord, WriteOutcome};
