//! Persistent storage using redb.
//!
//! One database file holds everything a store needs to survive a restart:
//! - Writer log entries (local logs and replicated mirrors)
//! - Materialized index tables, one per partition
//! - Per-writer consumption cursors of each projection
//! - Topology membership records
//! - The store primary key used to derive local log keypairs

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};

use crate::crypto::generate_primary_key;
use crate::error::StoreError;

// Submodules
mod logs;
mod membership;
mod projection;

use logs::LOG_ENTRIES_TABLE;
use membership::MEMBERSHIP_TABLE;

pub use membership::MemberRecord;
pub(crate) use projection::{
    clear_cursors, index_definition, index_table_name, write_cursor, CURSORS_TABLE,
};

// Table definitions
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Get a reference to the shared database handle
    ///
    /// The projection engine opens its own write transactions on this handle so
    /// index writes and cursor updates commit together.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all fixed tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
            let _ = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            let _ = write_txn.open_table(MEMBERSHIP_TABLE)?;
            let _ = write_txn.open_table(CURSORS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Primary Key Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Primary key storage key (there's only one per store)
    const PRIMARY_KEY: &'static str = "primary_key";

    /// Load the store's primary key, generating and persisting one on first use.
    pub fn load_or_create_primary_key(&self) -> Result<[u8; 32], StoreError> {
        if let Some(existing) = self.load_primary_key()? {
            return Ok(existing);
        }

        let key = generate_primary_key();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(Self::PRIMARY_KEY, key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(key)
    }

    /// Load the store's primary key.
    ///
    /// Returns `None` if the store has never been opened before.
    pub fn load_primary_key(&self) -> Result<Option<[u8; 32]>, StoreError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        match table.get(Self::PRIMARY_KEY)? {
            Some(v) => {
                let arr: [u8; 32] = v.value().try_into().map_err(|_| {
                    StoreError::Storage("Stored primary key is not 32 bytes".to_string())
                })?;
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_storage_can_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_primary_key_is_created_once() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();

        assert!(storage.load_primary_key().unwrap().is_none());
        let first = storage.load_or_create_primary_key().unwrap();
        let second = storage.load_or_create_primary_key().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_primary_key_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        let key = {
            let storage = Storage::new(&db_path).unwrap();
            storage.load_or_create_primary_key().unwrap()
        };

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.load_primary_key().unwrap(), Some(key));
    }
}
