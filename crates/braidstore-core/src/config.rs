//! Store configuration
//!
//! A store is configured in code with the `with_*` builders or loaded from a
//! JSON file:
//!
//! ```json
//! {
//!   "name": "garden",
//!   "data_dir": "/var/lib/braidstore/garden",
//!   "partitions": [{ "name": "default", "protocol": "kv" }],
//!   "private": false,
//!   "reassembly_timeout_ms": 30000
//! }
//! ```
//!
//! Omitted fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Partition every store gets when none is configured
pub const DEFAULT_PARTITION: &str = "default";

/// Largest fragment payload sent over a connection (16 KiB)
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024;

/// How long a partially received packet is kept
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Entries applied per projection batch
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// One partition: an index and the protocol that builds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition name, also the name of its local writer log
    pub name: String,
    /// Name of the registered protocol projecting this partition
    pub protocol: String,
    /// Hex encoded key sealing the local writer's entries at rest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

impl PartitionConfig {
    /// Partition driven by `protocol`
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            encryption_key: None,
        }
    }

    /// Seal the local writer's entries with `key`
    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(hex::encode(key));
        self
    }

    pub(crate) fn decoded_encryption_key(&self) -> StoreResult<Option<[u8; 32]>> {
        let Some(hex_key) = &self.encryption_key else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key).map_err(|e| {
            StoreError::Serialization(format!("Invalid encryption key for {}: {}", self.name, e))
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            StoreError::Serialization(format!("Encryption key for {} must be 32 bytes", self.name))
        })?;
        Ok(Some(key))
    }
}

/// Configuration for [`Store::open`](crate::Store::open)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name; peers replicating the same name share a swarm topic
    pub name: String,
    /// Directory holding the database file
    pub data_dir: PathBuf,
    /// Partitions and their protocols
    pub partitions: Vec<PartitionConfig>,
    /// Refuse to join a swarm
    pub private: bool,
    /// Largest fragment payload in bytes
    pub max_chunk_size: usize,
    /// How long incomplete packets are buffered
    #[serde(rename = "reassembly_timeout_ms", with = "duration_ms")]
    pub reassembly_timeout: Duration,
    /// Entries per projection batch
    pub batch_size: usize,
    /// Entries returned by `query` without an explicit limit
    pub query_limit: usize,
    /// Keep indexes up to date in the background as logs grow
    pub live: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "braidstore".to_string(),
            data_dir: PathBuf::from("."),
            partitions: Vec::new(),
            private: false,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            query_limit: crate::index::DEFAULT_QUERY_LIMIT,
            live: true,
        }
    }
}

impl StoreConfig {
    /// Configuration for a store named `name` under `data_dir`
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    /// Add a partition
    pub fn with_partition(mut self, name: impl Into<String>, protocol: impl Into<String>) -> Self {
        self.partitions.push(PartitionConfig::new(name, protocol));
        self
    }

    /// Add a fully specified partition
    pub fn with_partition_config(mut self, partition: PartitionConfig) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Set `private`
    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Set `max_chunk_size`
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set `reassembly_timeout`
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Set `batch_size`
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set `query_limit`
    pub fn with_query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit;
        self
    }

    /// Set `live`
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Path of the database file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("braidstore.redb")
    }

    /// Configured partitions, or a single default one driven by `protocol`
    pub(crate) fn effective_partitions(&self, protocol: Option<&str>) -> Vec<PartitionConfig> {
        if !self.partitions.is_empty() {
            return self.partitions.clone();
        }
        match protocol {
            Some(protocol) => vec![PartitionConfig::new(DEFAULT_PARTITION, protocol)],
            None => Vec::new(),
        }
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_chunk_size == 0 {
            return Err(StoreError::Storage("max_chunk_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(StoreError::Storage("batch_size must be positive".into()));
        }
        let mut names: Vec<&str> = self.partitions.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(StoreError::Storage("partition names must be unique".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_chunk_size, 16 * 1024);
        assert_eq!(config.reassembly_timeout, Duration::from_secs(30));
        assert_eq!(config.query_limit, 100);
        assert!(config.live);
        assert!(!config.private);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StoreConfig = serde_json::from_str(
            r#"{"name":"garden","partitions":[{"name":"default","protocol":"kv"}],"reassembly_timeout_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.name, "garden");
        assert_eq!(config.partitions[0].protocol, "kv");
        assert_eq!(config.reassembly_timeout, Duration::from_millis(500));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let config = StoreConfig::new("garden", dir.path()).with_partition("users", "kv");
        std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        assert_eq!(StoreConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_default_partition_only_when_none_configured() {
        let config = StoreConfig::default();
        assert_eq!(
            config.effective_partitions(Some("kv")),
            vec![PartitionConfig::new(DEFAULT_PARTITION, "kv")]
        );

        let config = config.with_partition("users", "kv");
        assert_eq!(config.effective_partitions(Some("kv"))[0].name, "users");
    }

    #[test]
    fn test_validate() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::default().with_max_chunk_size(0).validate().is_err());
        assert!(StoreConfig::default()
            .with_partition("a", "kv")
            .with_partition("a", "kv")
            .validate()
            .is_err());
    }

    #[test]
    fn test_partition_encryption_key() {
        let partition = PartitionConfig::new("p", "kv").with_encryption_key([7u8; 32]);
        assert_eq!(partition.decoded_encryption_key().unwrap(), Some([7u8; 32]));

        let mut bad = PartitionConfig::new("p", "kv");
        bad.encryption_key = Some("abcd".into());
        assert!(bad.decoded_encryption_key().is_err());
    }
}
