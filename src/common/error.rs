//! Error types for shardkv

use crate::common::types::{ShardId, TxId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // === Decision log Errors ===
    #[error("Corrupted log entry: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Decision log write failed: {0}")]
    LogFailure(String),

    #[error("Node halted after a decision log failure")]
    NodeHalted,

    // === 2PC Errors ===
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),

    #[error("Transaction {tx_id} is in the wrong state: {reason}")]
    InvalidTransition { tx_id: TxId, reason: String },

    #[error("Shard {shard} reported failure: {reason}")]
    ParticipantFailed { shard: ShardId, reason: String },

    // === Routing Errors ===
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retryable errors are transport-level: the remote side may simply be
    /// down or slow. Everything a participant reports itself is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::ConnectionFailed(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Is this error fatal to the node that produced it?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LogFailure(_) | Error::NodeHalted)
    }
}
