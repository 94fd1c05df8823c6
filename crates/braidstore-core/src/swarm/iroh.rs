//! QUIC swarm over iroh
//!
//! Peers are iroh endpoints speaking the `braidstore/0` ALPN. The dialer opens
//! one bi-directional stream and writes the 32-byte topic before anything
//! else; the acceptor reads it to route the stream to the store that joined
//! that topic.

use std::collections::HashMap;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{PeerConnection, Swarm};
use crate::error::{StoreError, StoreResult};
use crate::types::Topic;

/// ALPN identifying braidstore replication streams
pub const BRAIDSTORE_ALPN: &[u8] = b"braidstore/0";

type TopicSenders = Arc<Mutex<HashMap<Topic, mpsc::UnboundedSender<PeerConnection>>>>;

/// Swarm backed by an iroh endpoint
pub struct IrohSwarm {
    endpoint: Endpoint,
    router: Router,
    topics: TopicSenders,
}

impl IrohSwarm {
    /// Bind an endpoint (with a fresh key unless one is given) and start
    /// accepting braidstore connections
    pub async fn bind(secret_key: Option<SecretKey>) -> StoreResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![BRAIDSTORE_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| StoreError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let topics: TopicSenders = Arc::new(Mutex::new(HashMap::new()));
        let handler = ReplicationHandler {
            topics: topics.clone(),
        };
        let router = Router::builder(endpoint.clone())
            .accept(BRAIDSTORE_ALPN, handler)
            .spawn();

        Ok(Self {
            endpoint,
            router,
            topics,
        })
    }

    /// This node's endpoint id, which peers dial
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// The underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect to a peer for a topic this swarm has joined
    pub async fn dial(&self, topic: Topic, addr: impl Into<EndpointAddr>) -> StoreResult<()> {
        let sender = self
            .topics
            .lock()
            .get(&topic)
            .cloned()
            .ok_or_else(|| StoreError::Network(format!("Not joined to {}", topic)))?;

        let addr = addr.into();
        let conn = self
            .endpoint
            .connect(addr.clone(), BRAIDSTORE_ALPN)
            .await
            .map_err(|e| StoreError::Network(format!("Failed to connect to peer: {}", e)))?;

        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| StoreError::Network(format!("Failed to open bi stream: {}", e)))?;

        send.write_all(topic.as_bytes())
            .await
            .map_err(|e| StoreError::Network(format!("Failed to send topic: {}", e)))?;

        let peer = conn.remote_id().to_string();
        info!(%peer, %topic, "Dialed peer");
        sender
            .send(PeerConnection {
                peer,
                reader: Box::new(recv),
                writer: Box::new(send),
            })
            .map_err(|_| StoreError::Network(format!("{} is no longer joined", topic)))?;

        tokio::spawn(async move {
            conn.closed().await;
        });
        Ok(())
    }

    /// Stop the router and close the endpoint
    pub async fn shutdown(self) -> StoreResult<()> {
        info!("Shutting down iroh swarm");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

impl Swarm for IrohSwarm {
    fn join(&self, topic: Topic) -> StoreResult<mpsc::UnboundedReceiver<PeerConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        if topics.get(&topic).is_some_and(|s| !s.is_closed()) {
            return Err(StoreError::Network(format!("Already joined {}", topic)));
        }
        topics.insert(topic, tx);
        debug!(%topic, "Joined topic");
        Ok(rx)
    }

    fn leave(&self, topic: Topic) -> StoreResult<()> {
        self.topics.lock().remove(&topic);
        debug!(%topic, "Left topic");
        Ok(())
    }
}

/// Routes accepted connections to the store that joined their topic
#[derive(Clone)]
struct ReplicationHandler {
    topics: TopicSenders,
}

impl std::fmt::Debug for ReplicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandler")
            .field("topics", &self.topics.lock().len())
            .finish()
    }
}

impl ReplicationHandler {
    async fn handle_connection(conn: Connection, topics: TopicSenders) -> StoreResult<()> {
        let peer = conn.remote_id().to_string();

        let (send, mut recv) = conn
            .accept_bi()
            .await
            .map_err(|e| StoreError::Network(format!("Failed to accept bi stream: {}", e)))?;

        let mut topic_bytes = [0u8; 32];
        recv.read_exact(&mut topic_bytes)
            .await
            .map_err(|e| StoreError::Network(format!("Failed to read topic: {}", e)))?;
        let topic = Topic(topic_bytes);

        let sender = topics.lock().get(&topic).cloned();
        let Some(sender) = sender else {
            debug!(%peer, %topic, "Connection for a topic we have not joined");
            conn.close(0u32.into(), b"unknown topic");
            return Ok(());
        };

        info!(%peer, %topic, "Accepted peer");
        sender
            .send(PeerConnection {
                peer,
                reader: Box::new(recv),
                writer: Box::new(send),
            })
            .map_err(|_| StoreError::Network(format!("{} is no longer joined", topic)))?;

        conn.closed().await;
        Ok(())
    }
}

impl ProtocolHandler for ReplicationHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let topics = self.topics.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting replication connection");
            if let Err(e) = Self::handle_connection(conn, topics).await {
                warn!(error = %e, "Failed to handle replication connection");
                return Err(AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}
