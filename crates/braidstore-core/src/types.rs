//! Core types for braidstore

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Context string for deriving swarm topics from a store name
const TOPIC_CONTEXT: &str = "braidstore 2024-06 swarm topic";

/// Public key identifying a writer log or an index view
///
/// This is the ed25519 verifying key of the log's keypair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogKey(pub [u8; 32]);

impl LogKey {
    /// Create a LogKey from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64 character hex string
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| StoreError::Serialization(format!("Invalid log key '{}': {}", s, e)))?;
        Self::from_slice(&bytes)
    }

    /// Build a key from a byte slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            StoreError::Serialization(format!("Log key must be 32 bytes (got {})", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// First 8 hex characters, for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for LogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for LogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogKey({})", self.short())
    }
}

/// Rendezvous identifier peers join on a swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// Derive the topic shared by every peer replicating the named store
    pub fn for_store(name: &str) -> Self {
        Self(blake3::derive_key(TOPIC_CONTEXT, name.as_bytes()))
    }

    /// Get the raw bytes of the topic
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "topic_{}", hex::encode(&self.0[..8]))
    }
}

/// Which topology set a member belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Log whose entries feed the projection
    Writer,
    /// Index view that receives/publishes the projection
    Index,
}

impl Role {
    /// Stable lowercase name, used in storage keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Index => "index",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a topology member
///
/// ```text
/// Active ──▶ Frozen ──▶ Destroyed
///    └──────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MemberState {
    /// Entries are consumed as the log grows
    Active,
    /// Only the first `length` entries are ever consumed
    Frozen {
        /// Snapshot length taken at removal time
        length: u64,
    },
    /// Detached; stored entries may be pruned
    Destroyed,
}

impl MemberState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: &MemberState) -> bool {
        matches!(
            (self, next),
            (MemberState::Active, MemberState::Frozen { .. })
                | (MemberState::Active, MemberState::Destroyed)
                | (MemberState::Frozen { .. }, MemberState::Destroyed)
        )
    }

    /// Active or frozen members still contribute entries
    pub fn is_attached(&self) -> bool {
        !matches!(self, MemberState::Destroyed)
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Active => write!(f, "active"),
            MemberState::Frozen { length } => write!(f, "frozen@{}", length),
            MemberState::Destroyed => write!(f, "destroyed"),
        }
    }
}
