//! Append-only writer logs
//!
//! A log is an ordered sequence of immutable entries identified by a
//! [`LogKey`]. Logs opened by name are local: their keypair is derived from the
//! store's primary key and only this process appends to them. Logs opened by
//! key are mirrors of a remote writer and only grow through replication.
//!
//! ```text
//! LogStore
//!   ├── logs: LogKey ──▶ LogState (entries, shared by every handle)
//!   ├── writable: keys this store can append to
//!   └── appends: broadcast of keys that grew
//!
//! LogHandle (live)      ──▶ sees every entry
//! LogHandle (snapshot)  ──▶ sees the first `len` entries, read-only
//! ```

mod merge;

pub use merge::{BatchEntry, CausalMerge};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::crypto::{derive_signing_key, log_key_for, LogCrypto};
use crate::error::{StoreError, StoreResult};
use crate::storage::Storage;
use crate::types::LogKey;

/// Capacity of the append notification channel
const APPEND_CHANNEL_CAPACITY: usize = 1024;

/// One entry of a writer log
///
/// `clock` records, for each other writer, how many of its entries the
/// appending store had consumed when this entry was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Causal dependencies as (writer, entries consumed)
    pub clock: Vec<(LogKey, u64)>,
    /// Encoded operation
    pub payload: Vec<u8>,
}

impl Entry {
    /// Create an entry without dependencies
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            clock: Vec::new(),
            payload,
        }
    }

    /// Attach causal dependencies
    pub fn with_clock(mut self, clock: Vec<(LogKey, u64)>) -> Self {
        self.clock = clock;
        self
    }

    /// Serialize with postcard
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from postcard bytes
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// How a log is addressed when opening it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// Local log whose keypair is derived from this name
    Name(String),
    /// Existing log (usually remote) identified by its public key
    Key(LogKey),
}

/// Options for [`LogStore::get`]
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Which log to open
    pub source: LogSource,
    /// Key used to seal entries at rest
    pub encryption_key: Option<[u8; 32]>,
}

impl LogOptions {
    /// Open a local, writable log by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            source: LogSource::Name(name.into()),
            encryption_key: None,
        }
    }

    /// Open a log by public key
    pub fn key(key: LogKey) -> Self {
        Self {
            source: LogSource::Key(key),
            encryption_key: None,
        }
    }

    /// Seal entries with the given key
    pub fn with_encryption_key(mut self, key: Option<[u8; 32]>) -> Self {
        self.encryption_key = key;
        self
    }
}

/// Entries of one log, shared by all handles of that log
#[derive(Default)]
struct LogState {
    entries: RwLock<Vec<Vec<u8>>>,
}

struct LogStoreInner {
    storage: Storage,
    primary_key: [u8; 32],
    logs: RwLock<HashMap<LogKey, Arc<LogState>>>,
    writable: RwLock<HashSet<LogKey>>,
    appends: broadcast::Sender<LogKey>,
}

/// Registry of every log a store holds, backed by redb
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<LogStoreInner>,
}

impl LogStore {
    /// Open the log store, loading every persisted log
    pub fn open(storage: Storage) -> StoreResult<Self> {
        let primary_key = storage.load_or_create_primary_key()?;
        let persisted = storage.load_all_logs()?;
        let count = persisted.len();

        let logs = persisted
            .into_iter()
            .map(|(key, entries)| {
                let state = LogState {
                    entries: RwLock::new(entries),
                };
                (key, Arc::new(state))
            })
            .collect();

        let (appends, _) = broadcast::channel(APPEND_CHANNEL_CAPACITY);
        debug!(logs = count, "Log store opened");

        Ok(Self {
            inner: Arc::new(LogStoreInner {
                storage,
                primary_key,
                logs: RwLock::new(logs),
                writable: RwLock::new(HashSet::new()),
                appends,
            }),
        })
    }

    /// Open (or create) a log and return a live handle to it
    pub fn get(&self, options: LogOptions) -> StoreResult<LogHandle> {
        let (key, writable) = match &options.source {
            LogSource::Name(name) => {
                let key = log_key_for(&derive_signing_key(&self.inner.primary_key, name));
                self.inner.writable.write().insert(key);
                (key, true)
            }
            LogSource::Key(key) => (*key, self.inner.writable.read().contains(key)),
        };

        let state = self.state(&key);
        Ok(LogHandle {
            key,
            state,
            store: self.clone(),
            crypto: options
                .encryption_key
                .as_ref()
                .map(|k| Arc::new(LogCrypto::new(k))),
            writable,
            snapshot: None,
        })
    }

    /// Subscribe to notifications of logs that grew
    pub fn subscribe(&self) -> broadcast::Receiver<LogKey> {
        self.inner.appends.subscribe()
    }

    /// Number of entries currently held for a log
    pub fn length(&self, key: &LogKey) -> u64 {
        self.inner
            .logs
            .read()
            .get(key)
            .map(|s| s.entries.read().len() as u64)
            .unwrap_or(0)
    }

    /// Whether this store can append to the log
    pub fn is_writable(&self, key: &LogKey) -> bool {
        self.inner.writable.read().contains(key)
    }

    /// Raw stored entries `[from, from + max)` of a log, for replication
    ///
    /// Entries of encrypted logs are returned sealed.
    pub fn raw_range(&self, key: &LogKey, from: u64, max: usize) -> Vec<Vec<u8>> {
        let logs = self.inner.logs.read();
        let Some(state) = logs.get(key) else {
            return Vec::new();
        };
        let entries = state.entries.read();
        entries
            .iter()
            .skip(from as usize)
            .take(max)
            .cloned()
            .collect()
    }

    /// Ingest replicated entries of a remote log
    ///
    /// Only contiguous data is accepted: entries starting past the current
    /// length are dropped, and entries already held are skipped. Returns the
    /// number of entries appended.
    pub fn put_replica(&self, key: &LogKey, start: u64, entries: Vec<Vec<u8>>) -> StoreResult<u64> {
        if self.is_writable(key) {
            debug!(log = %key.short(), "Ignoring replica entries for a local log");
            return Ok(0);
        }

        let state = self.state(key);
        let appended = {
            let mut held = state.entries.write();
            let len = held.len() as u64;
            if start > len {
                debug!(log = %key.short(), start, len, "Dropping non-contiguous replica entries");
                return Ok(0);
            }

            let skip = (len - start) as usize;
            if skip >= entries.len() {
                return Ok(0);
            }
            let fresh = &entries[skip..];
            self.inner.storage.save_log_entries(key, len, fresh)?;
            held.extend(fresh.iter().cloned());
            fresh.len() as u64
        };

        debug!(log = %key.short(), appended, "Stored replica entries");
        let _ = self.inner.appends.send(*key);
        Ok(appended)
    }

    /// Drop a log and every stored entry of it
    pub fn purge(&self, key: &LogKey) -> StoreResult<()> {
        if let Some(state) = self.inner.logs.write().remove(key) {
            state.entries.write().clear();
        }
        let removed = self.inner.storage.delete_log(key)?;
        info!(log = %key.short(), removed, "Purged log");
        Ok(())
    }

    fn state(&self, key: &LogKey) -> Arc<LogState> {
        if let Some(state) = self.inner.logs.read().get(key) {
            return state.clone();
        }
        self.inner.logs.write().entry(*key).or_default().clone()
    }
}

/// Handle to one log, live or frozen at a length
#[derive(Clone)]
pub struct LogHandle {
    key: LogKey,
    state: Arc<LogState>,
    store: LogStore,
    crypto: Option<Arc<LogCrypto>>,
    writable: bool,
    snapshot: Option<u64>,
}

impl LogHandle {
    /// Public key of the log
    pub fn key(&self) -> LogKey {
        self.key
    }

    /// Whether `append` is allowed on this handle
    pub fn is_writable(&self) -> bool {
        self.writable && self.snapshot.is_none()
    }

    /// Whether this handle is a point-in-time snapshot
    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Length the snapshot was taken at, which may exceed the entries held
    pub fn snapshot_length(&self) -> Option<u64> {
        self.snapshot
    }

    /// Append an entry, returning the new length
    pub fn append(&self, data: &[u8]) -> StoreResult<u64> {
        if !self.is_writable() {
            return Err(StoreError::ReadOnlyLog(self.key));
        }

        let stored = match &self.crypto {
            Some(crypto) => crypto.encrypt(data)?,
            None => data.to_vec(),
        };

        let len = {
            let mut entries = self.state.entries.write();
            let seq = entries.len() as u64;
            self.store.inner.storage.save_log_entry(&self.key, seq, &stored)?;
            entries.push(stored);
            seq + 1
        };

        let _ = self.store.inner.appends.send(self.key);
        Ok(len)
    }

    /// Number of visible entries
    pub fn len(&self) -> u64 {
        let held = self.state.entries.read().len() as u64;
        match self.snapshot {
            Some(limit) => held.min(limit),
            None => held,
        }
    }

    /// Whether the log has no visible entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the entry at `seq`, decrypting it if needed
    pub fn get(&self, seq: u64) -> StoreResult<Option<Vec<u8>>> {
        if seq >= self.len() {
            return Ok(None);
        }
        let raw = match self.state.entries.read().get(seq as usize) {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        match &self.crypto {
            Some(crypto) => crypto.decrypt(&raw).map(Some),
            None => Ok(Some(raw)),
        }
    }

    /// A read-only handle frozen at the current length
    pub fn snapshot(&self) -> LogHandle {
        self.snapshot_at(self.len())
    }

    /// A read-only handle frozen at `length` entries
    pub fn snapshot_at(&self, length: u64) -> LogHandle {
        LogHandle {
            snapshot: Some(length),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("key", &self.key)
            .field("len", &self.len())
            .field("writable", &self.writable)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}
