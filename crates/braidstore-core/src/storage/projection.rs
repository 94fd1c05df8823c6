//! Projection state: index tables and consumption cursors
//!
//! Each partition materializes its index into its own table named
//! `index/<partition>`. Cursors record, per (partition, writer), how many
//! entries of that writer the index has consumed. Both are written inside the
//! projection engine's batch transaction so they always agree.

use std::collections::BTreeMap;

use redb::{ReadableTable, TableDefinition, WriteTransaction};

use crate::error::StoreError;
use crate::types::LogKey;

use super::Storage;

/// Table for consumption cursors (key: (partition, writer key), value: entries consumed)
pub(crate) const CURSORS_TABLE: TableDefinition<(&str, &[u8]), u64> =
    TableDefinition::new("cursors");

/// Name of the index table backing a partition
pub(crate) fn index_table_name(partition: &str) -> String {
    format!("index/{}", partition)
}

/// Table definition for a partition's index, borrowing the table name
pub(crate) fn index_definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Set the cursor of one writer inside an open write transaction
pub(crate) fn write_cursor(
    txn: &WriteTransaction,
    partition: &str,
    writer: &LogKey,
    consumed: u64,
) -> Result<(), StoreError> {
    let mut table = txn.open_table(CURSORS_TABLE)?;
    table.insert((partition, writer.as_bytes().as_slice()), consumed)?;
    Ok(())
}

/// Remove every cursor of a partition inside an open write transaction
pub(crate) fn clear_cursors(txn: &WriteTransaction, partition: &str) -> Result<(), StoreError> {
    let mut table = txn.open_table(CURSORS_TABLE)?;
    let mut writers = Vec::new();
    for item in table.iter()? {
        let (k, _) = item?;
        let (p, w) = k.value();
        if p == partition {
            writers.push(w.to_vec());
        }
    }
    for w in &writers {
        table.remove((partition, w.as_slice()))?;
    }
    Ok(())
}

impl Storage {
    /// Make sure the index table of a partition exists
    pub fn ensure_index_table(&self, partition: &str) -> Result<(), StoreError> {
        let name = index_table_name(partition);
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let _ = write_txn.open_table(index_definition(&name))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the committed consumption cursors of a partition
    pub fn load_cursors(&self, partition: &str) -> Result<BTreeMap<LogKey, u64>, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;

        let mut cursors = BTreeMap::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let (p, w) = k.value();
            if p == partition {
                cursors.insert(LogKey::from_slice(w)?, v.value());
            }
        }
        Ok(cursors)
    }
}
