//! Writer discovery between peers
//!
//! On connect each side announces the writer keys it projects, one
//! [`WireMessage::Writers`] per partition. Keys the receiver has never seen
//! are attached as writers and returned so the session can request their
//! entries right away. Gossip is best-effort: failures are logged and never
//! stall the projection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::replication::WireMessage;
use crate::topology::{AddOptions, TopologyManager};
use crate::types::{LogKey, MemberState, Role};

/// Builds and consumes writer announcements
#[derive(Clone)]
pub struct GossipExtension {
    topology: Arc<TopologyManager>,
}

impl GossipExtension {
    /// Gossip over the given topology
    pub fn new(topology: Arc<TopologyManager>) -> Self {
        Self { topology }
    }

    /// Announcements for every partition
    pub fn announcements(&self) -> Vec<WireMessage> {
        self.topology
            .partitions()
            .into_iter()
            .filter_map(|partition| match self.topology.gossip_keys(&partition) {
                Ok(keys) => Some(WireMessage::Writers { partition, keys }),
                Err(e) => {
                    warn!(partition, error = %e, "Failed to collect gossip keys");
                    None
                }
            })
            .collect()
    }

    /// Merge an announcement, returning the keys newly attached as writers
    pub fn on_writers(&self, partition: &str, keys: &[LogKey]) -> Vec<LogKey> {
        let mut added = Vec::new();
        for key in keys {
            match self.topology.knows_writer(partition, key) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    debug!(partition, error = %e, "Ignoring announcement");
                    return added;
                }
            }

            if let Err(e) = self
                .topology
                .add_writer(partition, *key, AddOptions::default())
            {
                warn!(partition, key = %key.short(), error = %e, "Failed to add gossiped writer");
                continue;
            }
            if self.topology.member_state(partition, Role::Writer, key) == Some(MemberState::Active) {
                debug!(partition, key = %key.short(), "Discovered writer through gossip");
                added.push(*key);
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogStore;
    use crate::storage::Storage;
    use crate::topology::RemoveOptions;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn gossip() -> (GossipExtension, Arc<TopologyManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let logs = LogStore::open(storage.clone()).unwrap();
        let (tx, _) = broadcast::channel(16);
        let topology = Arc::new(TopologyManager::new(logs, storage, tx));
        topology.add_partition("default", None).unwrap();
        (GossipExtension::new(topology.clone()), topology, dir)
    }

    #[test]
    fn test_announcement_lists_local_and_active_writers() {
        let (gossip, topology, _dir) = gossip();
        let local = topology.local_writer("default").unwrap().key();
        let active = LogKey::from_bytes([1u8; 32]);
        let frozen = LogKey::from_bytes([2u8; 32]);
        topology.add_writer("default", active, AddOptions::default()).unwrap();
        topology.add_writer("default", frozen, AddOptions::default()).unwrap();
        topology
            .remove_writer("default", frozen, RemoveOptions::freeze())
            .unwrap();

        let announcements = gossip.announcements();
        assert_eq!(
            announcements,
            vec![WireMessage::Writers {
                partition: "default".into(),
                keys: vec![local, active],
            }]
        );
    }

    #[test]
    fn test_unknown_keys_are_added_once() {
        let (gossip, topology, _dir) = gossip();
        let local = topology.local_writer("default").unwrap().key();
        let remote = LogKey::from_bytes([9u8; 32]);

        assert_eq!(gossip.on_writers("default", &[local, remote]), vec![remote]);
        assert!(gossip.on_writers("default", &[remote]).is_empty());
        assert_eq!(topology.keys("default").unwrap().writers.len(), 1);
    }

    #[test]
    fn test_destroyed_keys_stay_out() {
        let (gossip, topology, _dir) = gossip();
        let remote = LogKey::from_bytes([9u8; 32]);
        topology.add_writer("default", remote, AddOptions::default()).unwrap();
        topology
            .remove_writer("default", remote, RemoveOptions::destroy())
            .unwrap();

        assert!(gossip.on_writers("default", &[remote]).is_empty());
        assert_eq!(
            topology.member_state("default", Role::Writer, &remote),
            Some(MemberState::Destroyed)
        );
    }

    #[test]
    fn test_unknown_partition_is_ignored() {
        let (gossip, _topology, _dir) = gossip();
        assert!(gossip
            .on_writers("missing", &[LogKey::from_bytes([1u8; 32])])
            .is_empty());
    }
}
