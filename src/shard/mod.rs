//! Shard node implementation
//!
//! Each shard owns the keys with `key mod N == shard` and plays the
//! participant role in two-phase commit:
//! - Per-key FIFO locks serialize overlapping writers
//! - Committed payloads land in an in-memory value map
//! - Votes and decisions go to a durable decision log first

pub mod lock_manager;
pub mod participant;
pub mod server;
pub mod store;

pub use participant::{Participant, ParticipantRecord};
pub use server::ShardServer;
