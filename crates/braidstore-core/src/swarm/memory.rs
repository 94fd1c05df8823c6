//! In-process swarm
//!
//! Every [`MemorySwarm`] created from the same [`MemoryHub`] can reach the
//! others. Joining a topic connects the new member to every member already
//! present, using `tokio::io::duplex` pipes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{PeerConnection, Swarm};
use crate::error::{StoreError, StoreResult};
use crate::types::Topic;

/// Buffer size of each direction of an in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

type Members = HashMap<String, mpsc::UnboundedSender<PeerConnection>>;

/// Shared rendezvous point for in-memory swarms
#[derive(Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<Topic, Members>>>,
}

impl MemoryHub {
    /// Empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// A swarm member named `id`
    pub fn swarm(&self, id: impl Into<String>) -> MemorySwarm {
        MemorySwarm {
            id: id.into(),
            hub: self.clone(),
        }
    }
}

/// One member of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemorySwarm {
    id: String,
    hub: MemoryHub,
}

impl MemorySwarm {
    /// Name of this member
    pub fn id(&self) -> &str {
        &self.id
    }
}

fn pipe(local: &str, remote: &str) -> (PeerConnection, PeerConnection) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        PeerConnection {
            peer: remote.to_string(),
            reader: Box::new(a_read),
            writer: Box::new(a_write),
        },
        PeerConnection {
            peer: local.to_string(),
            reader: Box::new(b_read),
            writer: Box::new(b_write),
        },
    )
}

impl Swarm for MemorySwarm {
    fn join(&self, topic: Topic) -> StoreResult<mpsc::UnboundedReceiver<PeerConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.hub.topics.lock();
        let members = topics.entry(topic).or_default();
        if members.contains_key(&self.id) {
            return Err(StoreError::Network(format!(
                "{} already joined {}",
                self.id, topic
            )));
        }

        members.retain(|_, sender| !sender.is_closed());
        for (peer_id, sender) in members.iter() {
            let (ours, theirs) = pipe(&self.id, peer_id);
            if sender.send(theirs).is_ok() {
                let _ = tx.send(ours);
                debug!(local = %self.id, peer = %peer_id, %topic, "Memory peers connected");
            }
        }
        members.insert(self.id.clone(), tx);
        Ok(rx)
    }

    fn leave(&self, topic: Topic) -> StoreResult<()> {
        let mut topics = self.hub.topics.lock();
        if let Some(members) = topics.get_mut(&topic) {
            members.remove(&self.id);
            if members.is_empty() {
                topics.remove(&topic);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_members_of_a_topic_are_connected() {
        let hub = MemoryHub::new();
        let topic = Topic::for_store("t");
        let mut a = hub.swarm("a").join(topic).unwrap();
        let mut b = hub.swarm("b").join(topic).unwrap();

        let mut at_a = a.recv().await.unwrap();
        let mut at_b = b.recv().await.unwrap();
        assert_eq!(at_a.peer, "b");
        assert_eq!(at_b.peer, "a");

        at_b.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        at_a.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::new();
        let mut a = hub.swarm("a").join(Topic::for_store("one")).unwrap();
        let _b = hub.swarm("b").join(Topic::for_store("two")).unwrap();
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_double_join_is_rejected_until_leave() {
        let hub = MemoryHub::new();
        let swarm = hub.swarm("a");
        let topic = Topic::for_store("t");
        let _rx = swarm.join(topic).unwrap();
        assert!(swarm.join(topic).is_err());
        swarm.leave(topic).unwrap();
        assert!(swarm.join(topic).is_ok());
    }
}
