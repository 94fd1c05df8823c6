//! Materialized key-value index
//!
//! Each partition projects its writer logs into one redb table of
//! `key -> tagged value`. Keys are strings compared lexicographically.
//!
//! Reads come in two shapes:
//! - [`IndexView::query`] materializes at most `limit` entries (default 100)
//! - [`IndexView::query_stream`] pages lazily, opening a fresh read
//!   transaction per page so long scans never pin an old snapshot
//!
//! The protocol plugin never sees [`IndexView`]; it reads and writes through
//! [`CoreTxn`] and [`IndexReader`] inside the projection batch transaction.

mod txn;

pub use txn::{CoreTxn, IndexReader};

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableError};

use crate::codec::Value;
use crate::error::StoreResult;
use crate::storage::index_definition;

/// Entries returned by a query when no limit is given
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Entries fetched per read transaction by [`QueryStream`]
const STREAM_PAGE_SIZE: usize = 64;

/// Key range and paging options for index queries
///
/// When both an inclusive and an exclusive bound are given on the same side,
/// the tighter one applies. An empty or inverted range matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Keys greater than or equal to this
    pub gte: Option<String>,
    /// Keys strictly greater than this
    pub gt: Option<String>,
    /// Keys less than or equal to this
    pub lte: Option<String>,
    /// Keys strictly less than this
    pub lt: Option<String>,
    /// Maximum number of entries
    pub limit: Option<usize>,
    /// Descending key order
    pub reverse: bool,
}

impl RangeOptions {
    /// Every key, ascending
    pub fn all() -> Self {
        Self::default()
    }

    /// Keys starting with `prefix`
    pub fn prefix(prefix: &str) -> Self {
        let mut options = Self {
            gte: Some(prefix.to_string()),
            ..Self::default()
        };
        // smallest string greater than every key with this prefix
        let mut upper: Vec<char> = prefix.chars().collect();
        while let Some(last) = upper.pop() {
            if let Some(next) = char::from_u32(last as u32 + 1) {
                upper.push(next);
                options.lt = Some(upper.into_iter().collect());
                break;
            }
        }
        options
    }

    /// Set `gte`
    pub fn with_gte(mut self, key: impl Into<String>) -> Self {
        self.gte = Some(key.into());
        self
    }

    /// Set `gt`
    pub fn with_gt(mut self, key: impl Into<String>) -> Self {
        self.gt = Some(key.into());
        self
    }

    /// Set `lte`
    pub fn with_lte(mut self, key: impl Into<String>) -> Self {
        self.lte = Some(key.into());
        self
    }

    /// Set `lt`
    pub fn with_lt(mut self, key: impl Into<String>) -> Self {
        self.lt = Some(key.into());
        self
    }

    /// Set `limit`
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Iterate in descending order
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Effective bounds, or `None` when the range is empty
    pub(crate) fn bounds(&self) -> Option<(Bound<&str>, Bound<&str>)> {
        let lower = tighter(
            self.gte.as_deref().map(Bound::Included),
            self.gt.as_deref().map(Bound::Excluded),
            |a, b| a > b,
        );
        let upper = tighter(
            self.lte.as_deref().map(Bound::Included),
            self.lt.as_deref().map(Bound::Excluded),
            |a, b| a < b,
        );

        let empty = match (lower, upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        };

        if empty {
            None
        } else {
            Some((lower, upper))
        }
    }
}

/// Pick the tighter of an inclusive and an exclusive bound on the same side
fn tighter<'a>(
    inclusive: Option<Bound<&'a str>>,
    exclusive: Option<Bound<&'a str>>,
    beyond: impl Fn(&str, &str) -> bool,
) -> Bound<&'a str> {
    match (inclusive, exclusive) {
        (Some(Bound::Included(i)), Some(Bound::Excluded(e))) => {
            if beyond(i, e) {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
        (Some(b), None) | (None, Some(b)) => b,
        _ => Bound::Unbounded,
    }
}

/// Scan a range of an index table into decoded entries
pub(crate) fn scan<T>(
    table: &T,
    range: &RangeOptions,
    default_limit: usize,
) -> StoreResult<Vec<(String, Value)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let Some(bounds) = range.bounds() else {
        return Ok(Vec::new());
    };
    let limit = range.limit.unwrap_or(default_limit);
    if limit == 0 {
        return Ok(Vec::new());
    }

    let range_iter = table.range::<&str>(bounds)?;
    let iter: Box<dyn Iterator<Item = _> + '_> = if range.reverse {
        Box::new(range_iter.rev())
    } else {
        Box::new(range_iter)
    };

    let mut out = Vec::new();
    for item in iter.take(limit) {
        let (k, v) = item?;
        out.push((k.value().to_string(), Value::decode(v.value())?));
    }
    Ok(out)
}

/// Read-only view of a partition's committed index
#[derive(Clone)]
pub struct IndexView {
    db: Arc<RwLock<Database>>,
    table_name: String,
    default_limit: usize,
}

impl IndexView {
    pub(crate) fn new(db: Arc<RwLock<Database>>, table_name: String, default_limit: usize) -> Self {
        Self {
            db,
            table_name,
            default_limit,
        }
    }

    /// Look up one key
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(index_definition(&self.table_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(v) => Ok(Some(Value::decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Collect the entries of a range, capped at `limit` (default 100)
    pub fn query(&self, range: &RangeOptions) -> StoreResult<Vec<(String, Value)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(index_definition(&self.table_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        scan(&table, range, self.default_limit)
    }

    /// Lazily iterate a range; without a `limit` the whole range is visited
    pub fn query_stream(&self, range: RangeOptions) -> QueryStream {
        QueryStream {
            view: self.clone(),
            remaining: range.limit,
            range,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Number of entries in the index
    pub fn len(&self) -> StoreResult<u64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        match read_txn.open_table(index_definition(&self.table_name)) {
            Ok(table) => Ok(table.len()?),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the index holds no entries
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Order-preserving paged iterator over an index range
pub struct QueryStream {
    view: IndexView,
    range: RangeOptions,
    remaining: Option<usize>,
    buffer: VecDeque<(String, Value)>,
    exhausted: bool,
}

impl QueryStream {
    fn fill(&mut self) -> StoreResult<()> {
        let page = match self.remaining {
            Some(remaining) => remaining.min(STREAM_PAGE_SIZE),
            None => STREAM_PAGE_SIZE,
        };
        if page == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let mut request = self.range.clone();
        request.limit = Some(page);
        let entries = self.view.query(&request)?;

        if entries.len() < page {
            self.exhausted = true;
        }
        if let Some((last, _)) = entries.last() {
            if self.range.reverse {
                self.range.lte = None;
                self.range.lt = Some(last.clone());
            } else {
                self.range.gte = None;
                self.range.gt = Some(last.clone());
            }
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= entries.len();
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

impl Iterator for QueryStream {
    type Item = StoreResult<(String, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
