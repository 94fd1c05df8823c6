//! Store - the primary entry point for braidstore
//!
//! A [`Store`] ties the pieces together:
//! - [`LogStore`] holding every writer log in redb
//! - [`TopologyManager`] tracking writers and indexes per partition
//! - one [`ProjectionEngine`] per partition materializing the index
//! - swarm sessions replicating logs and gossiping writer keys
//!
//! # Example
//!
//! ```ignore
//! use braidstore_core::{ProtocolSet, Store, StoreConfig};
//!
//! let config = StoreConfig::new("garden", "/tmp/garden").with_partition("default", "kv");
//! let store = Store::open(config, ProtocolSet::new().with(Kv)).await?;
//!
//! store.append("default", &KvOp::Set { key: "k".into(), value: "v".into() })?;
//! store.update("default")?;
//! assert!(store.get("default", "k")?.is_some());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::codec::Value;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::events::{StoreEvent, EVENT_CHANNEL_CAPACITY};
use crate::gossip::GossipExtension;
use crate::index::{IndexView, QueryStream, RangeOptions};
use crate::log::{Entry, LogStore};
use crate::projection::ProjectionEngine;
use crate::protocol::{encode_op, ProtocolSet};
use crate::replication::session::{run_session, SessionContext};
use crate::storage::Storage;
use crate::swarm::Swarm;
use crate::topology::{AddOptions, RemoveOptions, TopologyKeys, TopologyManager};
use crate::types::{LogKey, Topic};

type Engines = Arc<BTreeMap<String, Arc<ProjectionEngine>>>;

/// An open swarm membership
struct SwarmLink {
    swarm: Arc<dyn Swarm>,
    task: JoinHandle<()>,
}

/// A replicated store of partitioned, log-projected key-value indexes
pub struct Store {
    config: StoreConfig,
    topic: Topic,
    logs: LogStore,
    topology: Arc<TopologyManager>,
    engines: Engines,
    events: broadcast::Sender<StoreEvent>,
    wake: Arc<Notify>,
    projector: Mutex<Option<JoinHandle<()>>>,
    link: Mutex<Option<SwarmLink>>,
}

impl Store {
    /// Open (or create) the store described by `config`
    ///
    /// Every configured partition must name a protocol in `protocols`. Without
    /// configured partitions a single `default` partition is created, which
    /// requires exactly one registered protocol.
    pub async fn open(config: StoreConfig, protocols: ProtocolSet) -> StoreResult<Self> {
        config.validate()?;

        let default_protocol = {
            let names: Vec<&str> = protocols.names().collect();
            (names.len() == 1).then(|| names[0].to_string())
        };
        let partitions = config.effective_partitions(default_protocol.as_deref());
        if partitions.is_empty() {
            return Err(StoreError::UnknownProtocol(
                "no partitions configured and no single protocol to default to".to_string(),
            ));
        }
        for partition in &partitions {
            if !protocols.contains(&partition.protocol) {
                return Err(StoreError::UnknownProtocol(partition.protocol.clone()));
            }
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::new(config.db_path())?;
        let logs = LogStore::open(storage.clone())?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let topology = Arc::new(TopologyManager::new(
            logs.clone(),
            storage.clone(),
            events.clone(),
        ));

        let mut engines = BTreeMap::new();
        for partition in &partitions {
            topology.add_partition(&partition.name, partition.decoded_encryption_key()?)?;
            topology.add_known_users(&partition.name)?;

            let engine = ProjectionEngine::new(
                &partition.name,
                storage.clone(),
                protocols.get(&partition.protocol)?,
                config.batch_size,
                config.query_limit,
                events.clone(),
            )?;
            engines.insert(partition.name.clone(), Arc::new(engine));
        }
        let engines: Engines = Arc::new(engines);

        let store = Self {
            topic: Topic::for_store(&config.name),
            config,
            logs,
            topology,
            engines,
            events,
            wake: Arc::new(Notify::new()),
            projector: Mutex::new(None),
            link: Mutex::new(None),
        };

        // Entries appended or replicated before a crash may not be consumed yet
        project_all(&store.topology, &store.engines);

        if store.config.live {
            store.start_projector();
        }

        info!(
            name = %store.config.name,
            topic = %store.topic,
            partitions = store.engines.len(),
            live = store.config.live,
            "Store opened"
        );
        Ok(store)
    }

    fn start_projector(&self) {
        let mut appends = self.logs.subscribe();
        let topology = self.topology.clone();
        let engines = self.engines.clone();
        let wake = self.wake.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    appended = appends.recv() => match appended {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            while appends.try_recv().is_ok() {}
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = wake.notified() => {}
                }

                let topology = topology.clone();
                let engines = engines.clone();
                // redb commits block
                let pass = tokio::task::spawn_blocking(move || project_all(&topology, &engines));
                if let Err(e) = pass.await {
                    warn!(error = %e, "Projection pass panicked");
                }
            }
            debug!("Projection loop stopped");
        });
        *self.projector.lock() = Some(task);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Swarm topic derived from the store name
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Names of every partition
    pub fn partitions(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// The underlying log store
    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// The topology manager
    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn engine(&self, partition: &str) -> StoreResult<&Arc<ProjectionEngine>> {
        self.engines
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Read-only view of a partition's index
    pub fn view(&self, partition: &str) -> StoreResult<IndexView> {
        Ok(self.engine(partition)?.view())
    }

    /// Value stored under `key`
    pub fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
        self.engine(partition)?.view().get(key)
    }

    /// Entries within `range`, capped at the query limit
    pub fn query(&self, partition: &str, range: &RangeOptions) -> StoreResult<Vec<(String, Value)>> {
        self.engine(partition)?.view().query(range)
    }

    /// Lazily paged entries within `range`
    pub fn query_stream(&self, partition: &str, range: RangeOptions) -> StoreResult<QueryStream> {
        Ok(self.engine(partition)?.view().query_stream(range))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Append an operation to the partition's local writer log
    ///
    /// The operation is first run against the current index; if the protocol
    /// rejects it the error is returned and nothing is written. The entry's
    /// clock records how much of every other writer the local index had
    /// consumed, so the operation replays after everything it could have
    /// observed. Returns the new length of the local log. When the store is
    /// not live the operation is projected before returning.
    pub fn append<O: Serialize>(&self, partition: &str, op: &O) -> StoreResult<u64> {
        let engine = self.engine(partition)?;
        let writer = self.topology.local_writer(partition)?;
        let local = writer.key();

        let payload = encode_op(op)?;
        engine.check(&payload)?;

        let clock: Vec<(LogKey, u64)> = engine
            .cursors()?
            .into_iter()
            .filter(|(key, consumed)| *key != local && *consumed > 0)
            .collect();

        let entry = Entry::new(payload).with_clock(clock);
        let length = writer.append(&entry.encode()?)?;
        debug!(partition, length, "Appended operation");

        if !self.config.live {
            self.update(partition)?;
        }
        Ok(length)
    }

    /// Consume every unconsumed entry of a partition
    pub fn update(&self, partition: &str) -> StoreResult<usize> {
        let engine = self.engine(partition)?;
        engine.update(self.topology.writer_handles(partition)?)
    }

    /// Clear a partition's index and replay it from every writer log
    pub fn rebuild(&self, partition: &str) -> StoreResult<usize> {
        let engine = self.engine(partition)?;
        engine.rebuild(self.topology.writer_handles(partition)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topology
    // ═══════════════════════════════════════════════════════════════════════

    /// Attach a remote writer log
    pub fn add_writer(&self, partition: &str, key: LogKey, options: AddOptions) -> StoreResult<()> {
        self.topology.add_writer(partition, key, options)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Freeze or destroy a remote writer
    pub fn remove_writer(
        &self,
        partition: &str,
        key: LogKey,
        options: RemoveOptions,
    ) -> StoreResult<()> {
        self.topology.remove_writer(partition, key, options)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Attach a remote index
    pub fn add_index(&self, partition: &str, key: LogKey, options: AddOptions) -> StoreResult<()> {
        self.topology.add_index(partition, key, options)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Freeze or destroy a remote index
    pub fn remove_index(
        &self,
        partition: &str,
        key: LogKey,
        options: RemoveOptions,
    ) -> StoreResult<()> {
        self.topology.remove_index(partition, key, options)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Local and remote keys of a partition
    pub fn get_keys(&self, partition: &str) -> StoreResult<TopologyKeys> {
        self.engine(partition)?;
        self.topology.keys(partition)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Networking
    // ═══════════════════════════════════════════════════════════════════════

    /// Join the store's topic on `swarm` and replicate with every peer found
    pub fn connect(&self, swarm: Arc<dyn Swarm>) -> StoreResult<()> {
        if self.config.private {
            return Err(StoreError::AccessDenied(format!(
                "store {} is private",
                self.config.name
            )));
        }

        let mut link = self.link.lock();
        if link.is_some() {
            return Err(StoreError::Network("Store is already connected".to_string()));
        }

        let mut incoming = swarm.join(self.topic)?;
        let ctx = SessionContext {
            topic: self.topic,
            private: self.config.private,
            logs: self.logs.clone(),
            topology: self.topology.clone(),
            gossip: GossipExtension::new(self.topology.clone()),
            max_chunk_size: self.config.max_chunk_size,
            reassembly_timeout: self.config.reassembly_timeout,
            events: self.events.clone(),
        };

        let task = tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    conn = incoming.recv() => match conn {
                        Some(conn) => {
                            sessions.spawn(run_session(ctx.clone(), conn));
                        }
                        None => break,
                    },
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                }
            }
            while sessions.join_next().await.is_some() {}
        });

        info!(topic = %self.topic, "Joined swarm");
        *link = Some(SwarmLink { swarm, task });
        Ok(())
    }

    /// Leave the swarm, aborting every peer session
    ///
    /// Operations already applied stay applied.
    pub async fn disconnect(&self) -> StoreResult<()> {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return Ok(());
        };

        if let Err(e) = link.swarm.leave(self.topic) {
            warn!(error = %e, "Failed to leave topic");
        }
        link.task.abort();
        let _ = link.task.await;
        info!(topic = %self.topic, "Left swarm");
        Ok(())
    }

    /// Whether the store is joined to a swarm
    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Disconnect and stop the projection loop
    pub async fn close(&self) -> StoreResult<()> {
        self.disconnect().await?;
        let projector = self.projector.lock().take();
        if let Some(task) = projector {
            task.abort();
            let _ = task.await;
        }
        info!(name = %self.config.name, "Store closed");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(task) = self.projector.lock().take() {
            task.abort();
        }
        if let Some(link) = self.link.lock().take() {
            let _ = link.swarm.leave(self.topic);
            link.task.abort();
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.config.name)
            .field("topic", &self.topic)
            .field("partitions", &self.partitions())
            .finish_non_exhaustive()
    }
}

/// Run every partition's projection; failures are already reported as events
fn project_all(topology: &TopologyManager, engines: &BTreeMap<String, Arc<ProjectionEngine>>) {
    for (partition, engine) in engines {
        let result = topology
            .writer_handles(partition)
            .and_then(|inputs| engine.update(inputs));
        if let Err(e) = result {
            warn!(partition, error = %e, "Projection stopped");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Owns open stores, keyed by data directory
///
/// Opening a directory that is already open returns the existing store.
#[derive(Default)]
pub struct StoreRegistry {
    stores: tokio::sync::Mutex<HashMap<PathBuf, Arc<Store>>>,
}

impl StoreRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the store for `config.data_dir`, or return the one already open
    pub async fn open(&self, config: StoreConfig, protocols: ProtocolSet) -> StoreResult<Arc<Store>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&config.data_dir) {
            debug!(data_dir = %config.data_dir.display(), "Reusing open store");
            return Ok(store.clone());
        }

        let data_dir = config.data_dir.clone();
        let store = Arc::new(Store::open(config, protocols).await?);
        stores.insert(data_dir, store.clone());
        Ok(store)
    }

    /// The open store for `data_dir`
    pub async fn get(&self, data_dir: impl AsRef<Path>) -> Option<Arc<Store>> {
        self.stores.lock().await.get(data_dir.as_ref()).cloned()
    }

    /// Close and forget the store for `data_dir`; returns whether one was open
    pub async fn close(&self, data_dir: impl AsRef<Path>) -> StoreResult<bool> {
        let store = self.stores.lock().await.remove(data_dir.as_ref());
        match store {
            Some(store) => {
                store.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every open store
    pub async fn close_all(&self) -> StoreResult<()> {
        let stores: Vec<_> = self.stores.lock().await.drain().map(|(_, s)| s).collect();
        for store in stores {
            store.close().await?;
        }
        Ok(())
    }

    /// Number of open stores
    pub async fn len(&self) -> usize {
        self.stores.lock().await.len()
    }

    /// Whether no store is open
    pub async fn is_empty(&self) -> bool {
        self.stores.lock().await.is_empty()
    }
}
