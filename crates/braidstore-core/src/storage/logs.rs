//! Log entry persistence
//!
//! Every log the store knows about (local writer logs, local index logs and
//! replicated mirrors) keeps its entries in one table keyed by
//! `(log key bytes, sequence)`. Because redb orders tuple keys component-wise,
//! a range scan over one log key yields its entries in sequence order.

use std::collections::BTreeMap;

use redb::{ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::types::LogKey;

use super::Storage;

/// Table for log entries (key: (log key, seq), value: stored entry bytes)
pub(crate) const LOG_ENTRIES_TABLE: TableDefinition<(&[u8], u64), &[u8]> =
    TableDefinition::new("log_entries");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Log Entry Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist one entry at `seq` of the given log
    pub fn save_log_entry(&self, key: &LogKey, seq: u64, data: &[u8]) -> Result<(), StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            table.insert((key.as_bytes().as_slice(), seq), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Persist a contiguous run of entries starting at `start` in one transaction
    pub fn save_log_entries(
        &self,
        key: &LogKey,
        start: u64,
        entries: &[Vec<u8>],
    ) -> Result<(), StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            for (i, data) in entries.iter().enumerate() {
                table.insert((key.as_bytes().as_slice(), start + i as u64), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every stored entry of one log, in sequence order
    pub fn load_log_entries(&self, key: &LogKey) -> Result<Vec<Vec<u8>>, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(LOG_ENTRIES_TABLE)?;

        let bytes = key.as_bytes().as_slice();
        let mut entries = Vec::new();
        for item in table.range((bytes, 0u64)..=(bytes, u64::MAX))? {
            let (_, value) = item?;
            entries.push(value.value().to_vec());
        }
        Ok(entries)
    }

    /// Load all stored logs, grouped by key
    ///
    /// Used on open to warm the in-memory log cache.
    pub fn load_all_logs(&self) -> Result<BTreeMap<LogKey, Vec<Vec<u8>>>, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(LOG_ENTRIES_TABLE)?;

        let mut logs: BTreeMap<LogKey, Vec<Vec<u8>>> = BTreeMap::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let (key_bytes, _seq) = k.value();
            let key = LogKey::from_slice(key_bytes)?;
            logs.entry(key).or_default().push(v.value().to_vec());
        }
        Ok(logs)
    }

    /// Delete every stored entry of one log
    ///
    /// Returns the number of entries removed.
    pub fn delete_log(&self, key: &LogKey) -> Result<usize, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            let bytes = key.as_bytes().as_slice();
            let mut seqs = Vec::new();
            for item in table.range((bytes, 0u64)..=(bytes, u64::MAX))? {
                let (k, _) = item?;
                seqs.push(k.value().1);
            }
            for seq in &seqs {
                table.remove((bytes, *seq))?;
            }
            removed = seqs.len();
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
