//! Log replication between peers
//!
//! Messages are serialized with postcard and carried by the framing protocol.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                                   Node B
//!   |--- Handshake {topic} ------------------>|
//!   |<-- Handshake {topic} -------------------|
//!   |                                         |
//!   |--- Writers {partition, keys} ---------->|   (gossip)
//!   |--- Have {key, length} ----------------->|
//!   |                                         |
//!   |    (B is behind on key, or just         |
//!   |     learned about it)                   |
//!   |                                         |
//!   |<-- Request {key, from} -----------------|
//!   |--- Entries {key, start, entries} ------>|
//!   |                                         |
//!   |    (A appends locally)                  |
//!   |--- Have {key, length} ----------------->|
//! ```

pub(crate) mod session;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::types::{LogKey, Topic};

/// Entries sent per [`WireMessage::Entries`]
pub const MAX_ENTRIES_PER_MESSAGE: usize = 256;

/// Messages exchanged over a peer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message in each direction
    Handshake {
        /// Topic of the store the sender replicates
        topic: Topic,
        /// Sender refuses replication
        private: bool,
    },

    /// Writer keys of one partition, announced on connect
    Writers {
        /// Partition the keys belong to
        partition: String,
        /// Local writer and active writers of the sender
        keys: Vec<LogKey>,
    },

    /// The sender holds `length` entries of `key`
    Have {
        /// Log key
        key: LogKey,
        /// Entries held
        length: u64,
    },

    /// Ask for entries of `key` starting at `from`
    Request {
        /// Log key
        key: LogKey,
        /// First wanted sequence
        from: u64,
    },

    /// Contiguous raw entries of `key` starting at `start`
    Entries {
        /// Log key
        key: LogKey,
        /// Sequence of the first entry
        start: u64,
        /// Stored entry bytes (sealed if the log is encrypted)
        entries: Vec<Vec<u8>>,
    },
}

impl WireMessage {
    /// Encode to bytes using postcard
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from bytes using postcard
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
