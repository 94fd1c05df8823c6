//! Error types for braidstore

use thiserror::Error;

use crate::types::{LogKey, Role};

/// Main error type for braidstore operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// An operation was rejected by the protocol plugin (unknown type, bad data)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A write did not read back as written
    #[error("Commit mismatch for key {key}: stored value does not match what was written")]
    CommitMismatch {
        /// Index key whose read-back differed
        key: String,
    },

    /// Adding a writer/index that is already present
    #[error("Duplicate {role} key: {key}")]
    DuplicateKey {
        /// Which topology set the key was added to
        role: Role,
        /// The key that was already present
        key: LogKey,
    },

    /// Topology or index operation on a partition that was never configured
    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    /// A partition names a protocol that was not registered
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Connecting a private store, or a peer refusing the handshake
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A partially received packet expired before all fragments arrived
    #[error("Reassembly timed out for packet {timestamp}:{offset}")]
    ReassemblyTimeout {
        /// Millisecond timestamp half of the packet id
        timestamp: u64,
        /// Offset half of the packet id
        offset: u64,
    },

    /// A transport fragment could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A batch entry skipped ahead of the writer's consumption cursor
    #[error("Out of order entry for writer {writer}: expected seq {expected}, got {got}")]
    OutOfOrder {
        /// Writer log the entry came from
        writer: LogKey,
        /// Next sequence the index expects from this writer
        expected: u64,
        /// Sequence carried by the entry
        got: u64,
    },

    /// Attempt to append to a mirror or a frozen snapshot
    #[error("Log is read-only: {0}")]
    ReadOnlyLog(LogKey),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias using StoreError
pub type StoreResult<T> = Result<T, StoreError>;
