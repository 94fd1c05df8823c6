//! Store events
//!
//! Everything a consumer may want to react to without polling is published on
//! a `tokio::sync::broadcast` channel:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  StoreEvent                                                     │
//! │  ├── Applied: a batch committed to a partition's index          │
//! │  ├── ApplyFailed: a batch was aborted                           │
//! │  ├── MemberAdded / MemberRemoved: topology changed              │
//! │  ├── DuplicateKey / TopologyRejected: topology change refused   │
//! │  ├── PeerConnected / PeerDisconnected: swarm sessions           │
//! │  └── Rebuilt: a partition's index was replayed from scratch     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Topology problems are reported here rather than returned, so a lagging
//! subscriber only ever misses notifications, never state.

use std::fmt;

use crate::types::{LogKey, MemberState, Role};

/// Default capacity for the event broadcast channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A batch of entries was committed to a partition's index
    Applied {
        /// Partition whose index changed
        partition: String,
        /// Number of entries consumed by the batch
        entries: usize,
    },
    /// A batch was aborted; nothing from it was committed
    ApplyFailed {
        /// Partition whose batch failed
        partition: String,
        /// Error message
        error: String,
    },
    /// A writer or index was attached
    MemberAdded {
        /// Partition the member belongs to
        partition: String,
        /// Writer or index set
        role: Role,
        /// Member key
        key: LogKey,
    },
    /// A writer or index was frozen or destroyed
    MemberRemoved {
        /// Partition the member belonged to
        partition: String,
        /// Writer or index set
        role: Role,
        /// Member key
        key: LogKey,
        /// State the member moved to
        state: MemberState,
    },
    /// A key was added to a set that already contains it
    DuplicateKey {
        /// Partition of the set
        partition: String,
        /// Writer or index set
        role: Role,
        /// The repeated key
        key: LogKey,
    },
    /// A topology change was refused
    TopologyRejected {
        /// Partition of the change
        partition: String,
        /// Writer or index set
        role: Role,
        /// Key the change targeted
        key: LogKey,
        /// Why it was refused
        reason: String,
    },
    /// A partition's index was cleared and replayed
    Rebuilt {
        /// Partition that was rebuilt
        partition: String,
        /// Entries replayed
        entries: usize,
    },
    /// A peer completed the handshake
    PeerConnected {
        /// Peer identifier reported by the swarm
        peer_id: String,
    },
    /// A peer session ended
    PeerDisconnected {
        /// Peer identifier reported by the swarm
        peer_id: String,
    },
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEvent::Applied { partition, entries } => {
                write!(f, "[{}] applied {} entries", partition, entries)
            }
            StoreEvent::ApplyFailed { partition, error } => {
                write!(f, "[{}] batch failed: {}", partition, error)
            }
            StoreEvent::MemberAdded {
                partition,
                role,
                key,
            } => write!(f, "[{}] {} {} added", partition, role, key.short()),
            StoreEvent::MemberRemoved {
                partition,
                role,
                key,
                state,
            } => write!(f, "[{}] {} {} {}", partition, role, key.short(), state),
            StoreEvent::DuplicateKey {
                partition,
                role,
                key,
            } => write!(f, "[{}] duplicate {} {}", partition, role, key.short()),
            StoreEvent::TopologyRejected {
                partition,
                role,
                key,
                reason,
            } => write!(
                f,
                "[{}] {} {} rejected: {}",
                partition,
                role,
                key.short(),
                reason
            ),
            StoreEvent::Rebuilt { partition, entries } => {
                write!(f, "[{}] rebuilt from {} entries", partition, entries)
            }
            StoreEvent::PeerConnected { peer_id } => write!(f, "peer {} connected", peer_id),
            StoreEvent::PeerDisconnected { peer_id } => {
                write!(f, "peer {} disconnected", peer_id)
            }
        }
    }
}
