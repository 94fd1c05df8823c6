//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::time::Duration;

use braidstore_core::{
    CoreTxn, IndexReader, LogKey, PartitionConfig, Protocol, ProtocolSet, Store, StoreConfig,
    StoreError, StoreResult,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

/// Operations of the test key-value protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum KvOp {
    Set { key: String, value: String },
    Del { key: String },
    /// Set `key` only while it holds `expected`
    Swap {
        key: String,
        expected: String,
        value: String,
    },
}

pub fn set(key: &str, value: &str) -> KvOp {
    KvOp::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub fn del(key: &str) -> KvOp {
    KvOp::Del {
        key: key.to_string(),
    }
}

pub fn swap(key: &str, expected: &str, value: &str) -> KvOp {
    KvOp::Swap {
        key: key.to_string(),
        expected: expected.to_string(),
        value: value.to_string(),
    }
}

/// Last writer in replay order wins
pub struct Kv;

impl Protocol for Kv {
    type Op = KvOp;

    fn name(&self) -> &str {
        "kv"
    }

    fn apply(&self, op: KvOp, core: &CoreTxn<'_>, index: &IndexReader<'_>) -> StoreResult<()> {
        match op {
            KvOp::Set { key, value } => core.put(&key, value),
            KvOp::Del { key } => core.del(&key),
            KvOp::Swap {
                key,
                expected,
                value,
            } => {
                let current = index.get(&key)?;
                if current.as_ref().and_then(|v| v.as_text()) != Some(expected.as_str()) {
                    return Err(StoreError::InvalidOperation(format!(
                        "{} does not hold {}",
                        key, expected
                    )));
                }
                core.put(&key, value)
            }
        }
    }
}

pub fn protocols() -> ProtocolSet {
    ProtocolSet::new().with(Kv)
}

/// A store in its own temporary directory
pub struct TestStore {
    pub store: Store,
    pub dir: TempDir,
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl TestStore {
    pub async fn new(name: &str, live: bool) -> Self {
        Self::open(name, live, PartitionConfig::new("default", "kv")).await
    }

    /// A store whose default partition seals its logs with `key`
    pub async fn encrypted(name: &str, live: bool, key: [u8; 32]) -> Self {
        Self::open(
            name,
            live,
            PartitionConfig::new("default", "kv").with_encryption_key(key),
        )
        .await
    }

    async fn open(name: &str, live: bool, partition: PartitionConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(name, dir.path())
            .with_partition_config(partition)
            .with_live(live)
            .with_max_chunk_size(256)
            .with_reassembly_timeout(Duration::from_secs(5));
        let store = Store::open(config, protocols()).await.unwrap();
        Self { store, dir }
    }

    pub fn writer_key(&self) -> LogKey {
        self.get_keys("default").unwrap().writer
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.get("default", key)
            .unwrap()
            .and_then(|v| v.as_text().map(str::to_string))
    }
}

/// Copy every entry of `key` that `from` holds and `to` lacks
pub fn replicate(from: &Store, to: &Store, key: &LogKey) {
    let start = to.logs().length(key);
    let entries = from.logs().raw_range(key, start, usize::MAX);
    to.logs().put_replica(key, start, entries).unwrap();
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
