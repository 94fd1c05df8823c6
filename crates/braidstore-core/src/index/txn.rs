//! Transactional index access for protocol plugins
//!
//! During a batch the projection engine opens one redb write transaction and
//! shares the partition's index table between two views:
//!
//! - [`CoreTxn`]: read/write, used to apply an operation's effects
//! - [`IndexReader`]: read-only, used to inspect state before writing
//!
//! Both views see the writes staged earlier in the same batch, so the result
//! of a replay never depends on where batch boundaries fall.

use std::cell::RefCell;

use redb::{ReadableTable, Table};

use crate::codec::Value;
use crate::error::{StoreError, StoreResult};

use super::{scan, RangeOptions};

/// Raw operations the projection needs from an index table
pub(crate) trait IndexTable {
    fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn scan(&self, range: &RangeOptions, default_limit: usize) -> StoreResult<Vec<(String, Value)>>;
    fn insert_raw(&mut self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn remove_raw(&mut self, key: &str) -> StoreResult<()>;
}

impl IndexTable for Table<'_, &'static str, &'static [u8]> {
    fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan(&self, range: &RangeOptions, default_limit: usize) -> StoreResult<Vec<(String, Value)>> {
        scan(self, range, default_limit)
    }

    fn insert_raw(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.insert(key, value)?;
        Ok(())
    }

    fn remove_raw(&mut self, key: &str) -> StoreResult<()> {
        self.remove(key)?;
        Ok(())
    }
}

/// Read/write index access handed to [`Protocol::apply`](crate::Protocol::apply)
pub struct CoreTxn<'a> {
    table: &'a RefCell<dyn IndexTable + 'a>,
    default_limit: usize,
}

impl<'a> CoreTxn<'a> {
    pub(crate) fn new(table: &'a RefCell<dyn IndexTable + 'a>, default_limit: usize) -> Self {
        Self {
            table,
            default_limit,
        }
    }

    /// Stage a write, verifying that it reads back as written
    pub fn put(&self, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        let encoded = value.into().encode()?;
        self.table.borrow_mut().insert_raw(key, &encoded)?;

        let stored = self
            .table
            .borrow()
            .get_raw(key)?
            .ok_or_else(|| StoreError::CommitMismatch {
                key: key.to_string(),
            })?;
        if stored != encoded || Value::decode(&stored)?.encode()? != encoded {
            return Err(StoreError::CommitMismatch {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Stage a delete; deleting a missing key is a no-op
    pub fn del(&self, key: &str) -> StoreResult<()> {
        self.table.borrow_mut().remove_raw(key)
    }

    /// Read a key, including writes staged in this batch
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        read(self.table, key)
    }

    /// Range query, including writes staged in this batch
    pub fn query(&self, range: &RangeOptions) -> StoreResult<Vec<(String, Value)>> {
        self.table.borrow().scan(range, self.default_limit)
    }
}

/// Read-only index access handed to [`Protocol::apply`](crate::Protocol::apply)
pub struct IndexReader<'a> {
    table: &'a RefCell<dyn IndexTable + 'a>,
    default_limit: usize,
}

impl<'a> IndexReader<'a> {
    pub(crate) fn new(table: &'a RefCell<dyn IndexTable + 'a>, default_limit: usize) -> Self {
        Self {
            table,
            default_limit,
        }
    }

    /// Read a key
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        read(self.table, key)
    }

    /// Range query
    pub fn query(&self, range: &RangeOptions) -> StoreResult<Vec<(String, Value)>> {
        self.table.borrow().scan(range, self.default_limit)
    }
}

fn read(table: &RefCell<dyn IndexTable + '_>, key: &str) -> StoreResult<Option<Value>> {
    match table.borrow().get_raw(key)? {
        Some(bytes) => Ok(Some(Value::decode(&bytes)?)),
        None => Ok(None),
    }
}
