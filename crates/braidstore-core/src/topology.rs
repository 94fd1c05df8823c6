//! Writer/index topology per partition
//!
//! Every partition has one local writer log and one local index key, plus two
//! sets of remote members:
//!
//! ```text
//! partition
//!   ├── local_writer  (named log, writable, always consumed)
//!   ├── local_index   (named log, identifies this store's index)
//!   ├── writers: LogKey ──▶ Member { Active | Frozen | Destroyed }
//!   └── indexes: LogKey ──▶ Member { Active | Frozen | Destroyed }
//! ```
//!
//! Removing a member without destroying it swaps its live handle for a
//! snapshot, so the entries it had contributed stay part of the projection
//! while later appends are ignored. Destroying detaches it for good and prunes
//! its stored entries.
//!
//! Only an unknown partition is an error. Duplicates and refused changes are
//! logged and reported as [`StoreEvent`]s.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::events::StoreEvent;
use crate::log::{LogHandle, LogOptions, LogStore};
use crate::storage::{MemberRecord, Storage};
use crate::types::{LogKey, MemberState, Role};

/// Options for attaching a writer or index
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Key the member's entries are sealed with
    pub encryption_key: Option<[u8; 32]>,
}

/// Options for detaching a writer or index
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Detach permanently and prune stored entries instead of freezing
    pub destroy: bool,
}

impl RemoveOptions {
    /// Freeze at the current length
    pub fn freeze() -> Self {
        Self { destroy: false }
    }

    /// Detach permanently
    pub fn destroy() -> Self {
        Self { destroy: true }
    }
}

/// Keys known to one partition
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyKeys {
    /// Local writer key
    pub writer: LogKey,
    /// Local index key
    pub index: LogKey,
    /// Remote writers and their state
    pub writers: Vec<(LogKey, MemberState)>,
    /// Remote indexes and their state
    pub indexes: Vec<(LogKey, MemberState)>,
}

struct Member {
    state: MemberState,
    handle: Option<LogHandle>,
    encryption_key: Option<[u8; 32]>,
}

struct PartitionTopology {
    local_writer: LogHandle,
    local_index: LogHandle,
    /// Key the partition's logs are sealed with; members inherit it
    encryption_key: Option<[u8; 32]>,
    writers: BTreeMap<LogKey, Member>,
    indexes: BTreeMap<LogKey, Member>,
}

impl PartitionTopology {
    fn local_key(&self, role: Role) -> LogKey {
        match role {
            Role::Writer => self.local_writer.key(),
            Role::Index => self.local_index.key(),
        }
    }

    fn set(&self, role: Role) -> &BTreeMap<LogKey, Member> {
        match role {
            Role::Writer => &self.writers,
            Role::Index => &self.indexes,
        }
    }

    fn set_mut(&mut self, role: Role) -> &mut BTreeMap<LogKey, Member> {
        match role {
            Role::Writer => &mut self.writers,
            Role::Index => &mut self.indexes,
        }
    }
}

/// Tracks the writer and index sets of every partition
pub struct TopologyManager {
    logs: LogStore,
    storage: Storage,
    partitions: RwLock<BTreeMap<String, PartitionTopology>>,
    events: broadcast::Sender<StoreEvent>,
}

impl TopologyManager {
    /// Create a manager with no partitions
    pub fn new(logs: LogStore, storage: Storage, events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            logs,
            storage,
            partitions: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Register a partition and open its local writer and index logs
    pub fn add_partition(&self, partition: &str, encryption_key: Option<[u8; 32]>) -> StoreResult<()> {
        if self.partitions.read().contains_key(partition) {
            return Ok(());
        }

        let local_writer = self
            .logs
            .get(LogOptions::named(partition).with_encryption_key(encryption_key))?;
        let local_index = self
            .logs
            .get(LogOptions::named(format!("{}/index", partition)))?;

        debug!(
            partition,
            writer = %local_writer.key().short(),
            index = %local_index.key().short(),
            "Partition registered"
        );

        self.partitions.write().insert(
            partition.to_string(),
            PartitionTopology {
                local_writer,
                local_index,
                encryption_key,
                writers: BTreeMap::new(),
                indexes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Names of every registered partition
    pub fn partitions(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Writable handle to the partition's local writer log
    pub fn local_writer(&self, partition: &str) -> StoreResult<LogHandle> {
        let parts = self.partitions.read();
        let part = parts
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;
        Ok(part.local_writer.clone())
    }

    /// Attach a remote writer log
    pub fn add_writer(&self, partition: &str, key: LogKey, options: AddOptions) -> StoreResult<()> {
        self.add_member(partition, Role::Writer, key, options)
    }

    /// Freeze or destroy a remote writer log
    pub fn remove_writer(
        &self,
        partition: &str,
        key: LogKey,
        options: RemoveOptions,
    ) -> StoreResult<()> {
        self.remove_member(partition, Role::Writer, key, options)
    }

    /// Attach a remote index
    pub fn add_index(&self, partition: &str, key: LogKey, options: AddOptions) -> StoreResult<()> {
        self.add_member(partition, Role::Index, key, options)
    }

    /// Freeze or destroy a remote index
    pub fn remove_index(
        &self,
        partition: &str,
        key: LogKey,
        options: RemoveOptions,
    ) -> StoreResult<()> {
        self.remove_member(partition, Role::Index, key, options)
    }

    /// Restore the persisted membership of a partition
    ///
    /// Returns the number of members restored.
    pub fn add_known_users(&self, partition: &str) -> StoreResult<usize> {
        let records = self.storage.load_members(partition)?;
        let mut parts = self.partitions.write();
        let part = parts
            .get_mut(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        let mut restored = 0;
        for record in records {
            if record.key == part.local_key(record.role) {
                continue;
            }
            if part.set(record.role).contains_key(&record.key) {
                continue;
            }

            let encryption_key = match &record.encryption_key {
                Some(hex_key) => Some(decode_encryption_key(hex_key)?),
                None => None,
            };
            let handle = match record.state {
                MemberState::Active => Some(self.logs.get(
                    LogOptions::key(record.key).with_encryption_key(encryption_key),
                )?),
                MemberState::Frozen { length } => Some(
                    self.logs
                        .get(LogOptions::key(record.key).with_encryption_key(encryption_key))?
                        .snapshot_at(length),
                ),
                MemberState::Destroyed => None,
            };

            part.set_mut(record.role).insert(
                record.key,
                Member {
                    state: record.state,
                    handle,
                    encryption_key,
                },
            );
            restored += 1;
        }

        if restored > 0 {
            info!(partition, restored, "Restored known members");
        }
        Ok(restored)
    }

    /// Handles the projection consumes: the local writer plus every active or
    /// frozen remote writer
    pub fn writer_handles(&self, partition: &str) -> StoreResult<Vec<LogHandle>> {
        let parts = self.partitions.read();
        let part = parts
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        let mut handles = vec![part.local_writer.clone()];
        handles.extend(part.writers.values().filter_map(|m| m.handle.clone()));
        Ok(handles)
    }

    /// Writer keys announced to peers: the local writer and active writers
    pub fn gossip_keys(&self, partition: &str) -> StoreResult<Vec<LogKey>> {
        let parts = self.partitions.read();
        let part = parts
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        let mut keys = vec![part.local_writer.key()];
        keys.extend(
            part.writers
                .iter()
                .filter(|(_, m)| m.state == MemberState::Active)
                .map(|(k, _)| *k),
        );
        Ok(keys)
    }

    /// Whether `key` is the local writer or any member of the writer set,
    /// destroyed members included
    pub fn knows_writer(&self, partition: &str, key: &LogKey) -> StoreResult<bool> {
        let parts = self.partitions.read();
        let part = parts
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;
        Ok(part.local_writer.key() == *key || part.writers.contains_key(key))
    }

    /// Current state of one member
    pub fn member_state(&self, partition: &str, role: Role, key: &LogKey) -> Option<MemberState> {
        let parts = self.partitions.read();
        parts
            .get(partition)
            .and_then(|p| p.set(role).get(key))
            .map(|m| m.state)
    }

    /// Whether entries of `key` should be fetched from peers
    ///
    /// True when some partition holds it as a remote writer that is active,
    /// or frozen past the entries stored locally.
    pub fn wants_entries(&self, key: &LogKey) -> bool {
        let held = self.logs.length(key);
        self.partitions.read().values().any(|part| {
            part.writers.get(key).is_some_and(|m| match m.state {
                MemberState::Active => true,
                MemberState::Frozen { length } => length > held,
                MemberState::Destroyed => false,
            })
        })
    }

    /// Every key of a partition
    pub fn keys(&self, partition: &str) -> StoreResult<TopologyKeys> {
        let parts = self.partitions.read();
        let part = parts
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        Ok(TopologyKeys {
            writer: part.local_writer.key(),
            index: part.local_index.key(),
            writers: part.writers.iter().map(|(k, m)| (*k, m.state)).collect(),
            indexes: part.indexes.iter().map(|(k, m)| (*k, m.state)).collect(),
        })
    }

    fn add_member(
        &self,
        partition: &str,
        role: Role,
        key: LogKey,
        options: AddOptions,
    ) -> StoreResult<()> {
        let mut parts = self.partitions.write();
        let part = parts
            .get_mut(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        if key == part.local_key(role) {
            debug!(partition, %role, key = %key.short(), "Ignoring add of local key");
            return Ok(());
        }

        match part.set(role).get(&key).map(|m| m.state) {
            Some(MemberState::Destroyed) => {
                warn!(partition, %role, key = %key.short(), "Refusing to re-add destroyed key");
                self.emit(StoreEvent::TopologyRejected {
                    partition: partition.to_string(),
                    role,
                    key,
                    reason: "key was destroyed".to_string(),
                });
                return Ok(());
            }
            Some(_) => {
                warn!(partition, %role, key = %key.short(), "Duplicate key");
                self.emit(StoreEvent::DuplicateKey {
                    partition: partition.to_string(),
                    role,
                    key,
                });
                return Ok(());
            }
            None => {}
        }

        let encryption_key = options.encryption_key.or(part.encryption_key);
        let handle = self
            .logs
            .get(LogOptions::key(key).with_encryption_key(encryption_key))?;
        part.set_mut(role).insert(
            key,
            Member {
                state: MemberState::Active,
                handle: Some(handle),
                encryption_key,
            },
        );
        self.persist(partition, role, key, MemberState::Active, encryption_key)?;

        info!(partition, %role, key = %key.short(), "Member added");
        self.emit(StoreEvent::MemberAdded {
            partition: partition.to_string(),
            role,
            key,
        });
        Ok(())
    }

    fn remove_member(
        &self,
        partition: &str,
        role: Role,
        key: LogKey,
        options: RemoveOptions,
    ) -> StoreResult<()> {
        let mut parts = self.partitions.write();
        let part = parts
            .get_mut(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;

        if key == part.local_key(role) {
            drop(parts);
            return self.reject(partition, role, key, "cannot remove the local key");
        }

        let Some(member) = part.set_mut(role).get_mut(&key) else {
            drop(parts);
            return self.reject(partition, role, key, "unknown member");
        };

        let next = if options.destroy {
            MemberState::Destroyed
        } else {
            match &member.handle {
                Some(handle) => MemberState::Frozen {
                    length: handle.len(),
                },
                None => MemberState::Destroyed,
            }
        };

        if !member.state.can_transition_to(&next) {
            let reason = format!("cannot move from {} to {}", member.state, next);
            drop(parts);
            return self.reject(partition, role, key, &reason);
        }

        member.state = next;
        member.handle = match (next, member.handle.take()) {
            (MemberState::Frozen { length }, Some(handle)) => Some(handle.snapshot_at(length)),
            _ => None,
        };
        let encryption_key = member.encryption_key;

        let purge = next == MemberState::Destroyed && !is_attached_elsewhere(&parts, partition, role, &key);
        drop(parts);

        self.persist(partition, role, key, next, encryption_key)?;
        if purge {
            self.logs.purge(&key)?;
        }

        info!(partition, %role, key = %key.short(), state = %next, "Member removed");
        self.emit(StoreEvent::MemberRemoved {
            partition: partition.to_string(),
            role,
            key,
            state: next,
        });
        Ok(())
    }

    fn persist(
        &self,
        partition: &str,
        role: Role,
        key: LogKey,
        state: MemberState,
        encryption_key: Option<[u8; 32]>,
    ) -> StoreResult<()> {
        self.storage.save_member(&MemberRecord {
            partition: partition.to_string(),
            role,
            key,
            state,
            encryption_key: encryption_key.map(hex::encode),
        })
    }

    fn reject(&self, partition: &str, role: Role, key: LogKey, reason: &str) -> StoreResult<()> {
        warn!(partition, %role, key = %key.short(), reason, "Topology change refused");
        self.emit(StoreEvent::TopologyRejected {
            partition: partition.to_string(),
            role,
            key,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}

/// Whether another partition or role still holds entries of `key`
fn is_attached_elsewhere(
    parts: &BTreeMap<String, PartitionTopology>,
    partition: &str,
    role: Role,
    key: &LogKey,
) -> bool {
    parts.iter().any(|(name, part)| {
        if part.local_writer.key() == *key || part.local_index.key() == *key {
            return true;
        }
        [Role::Writer, Role::Index].into_iter().any(|r| {
            if name == partition && r == role {
                return false;
            }
            part.set(r).get(key).is_some_and(|m| m.state.is_attached())
        })
    })
}

fn decode_encryption_key(hex_key: &str) -> StoreResult<[u8; 32]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| StoreError::Serialization(format!("Invalid encryption key: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("Encryption key must be 32 bytes".to_string()))
}
