//! Topology membership persistence
//!
//! Each writer/index attached to a partition is stored as a JSON record so
//! `add_known_users` can restore the topology when a store is reopened.

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{LogKey, MemberState, Role};

use super::Storage;

/// Table for membership records (key: "partition/role/hex", value: JSON MemberRecord)
pub(crate) const MEMBERSHIP_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("membership");

/// A persisted topology member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Partition the member belongs to
    pub partition: String,
    /// Writer or index set
    pub role: Role,
    /// Log key of the member
    pub key: LogKey,
    /// Lifecycle state at the time of the last change
    #[serde(flatten)]
    pub state: MemberState,
    /// Hex encoded encryption key the log was opened with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

impl MemberRecord {
    fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.partition, self.role, self.key.to_hex())
    }
}

impl Storage {
    /// Insert or overwrite a membership record
    pub fn save_member(&self, record: &MemberRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec(record)?;
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(MEMBERSHIP_TABLE)?;
            table.insert(record.storage_key().as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load all membership records of a partition
    ///
    /// Records that fail to decode are skipped with a warning.
    pub fn load_members(&self, partition: &str) -> Result<Vec<MemberRecord>, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(MEMBERSHIP_TABLE)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            match serde_json::from_slice::<MemberRecord>(value.value()) {
                Ok(record) if record.partition == partition => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = key.value(), error = %e, "Skipping corrupt membership record");
                }
            }
        }
        Ok(records)
    }
}
