//! Peer discovery and byte-stream transport
//!
//! A [`Swarm`] connects stores that join the same [`Topic`]. Each connection
//! is delivered as a pair of byte streams; everything above the bytes
//! (framing, handshake, replication) is handled by the store's sessions.
//!
//! Two implementations ship with the crate:
//! - [`MemorySwarm`]: in-process, for tests and embedding
//! - [`IrohSwarm`]: QUIC connections through an iroh endpoint

mod iroh;
mod memory;

pub use self::iroh::{IrohSwarm, BRAIDSTORE_ALPN};
pub use memory::{MemoryHub, MemorySwarm};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::types::Topic;

/// A connection to one peer
pub struct PeerConnection {
    /// Identifier of the remote peer, for logs and events
    pub peer: String,
    /// Bytes from the peer
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes to the peer
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Transport that connects peers sharing a topic
pub trait Swarm: Send + Sync {
    /// Start accepting connections for `topic`
    ///
    /// Every connection made while joined (incoming or dialed) is delivered
    /// on the returned channel.
    fn join(&self, topic: Topic) -> StoreResult<mpsc::UnboundedReceiver<PeerConnection>>;

    /// Stop delivering connections for `topic`
    fn leave(&self, topic: Topic) -> StoreResult<()>;
}
