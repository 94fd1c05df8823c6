//! Projection engine
//!
//! Turns the union of a partition's writer logs into its materialized index.
//!
//! ```text
//! writer logs ──▶ CausalMerge ──▶ batch ──▶ Protocol::apply ──▶ index table
//!                                   │                              │
//!                                   └──── cursors ◀── one write txn ┘
//! ```
//!
//! A batch is staged in a single redb write transaction together with the
//! per-writer cursors it advances, and commits or aborts as a whole. Entries
//! below a writer's cursor were already consumed and are skipped, which makes
//! re-applying a batch harmless.
//!
//! The committed index always equals a replay of its inputs from scratch.
//! When a late entry sorts before entries already applied, or an input was
//! detached, `update` rebuilds instead of appending out of order.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, WriteTransaction};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::events::StoreEvent;
use crate::index::{CoreTxn, IndexReader, IndexView};
use crate::log::{BatchEntry, CausalMerge, LogHandle};
use crate::protocol::DynProtocol;
use crate::storage::{clear_cursors, index_definition, index_table_name, write_cursor, Storage};
use crate::types::LogKey;

/// Applies ordered batches of writer entries to one partition's index
pub struct ProjectionEngine {
    partition: String,
    table_name: String,
    db: Arc<RwLock<Database>>,
    storage: Storage,
    protocol: Arc<dyn DynProtocol>,
    batch_size: usize,
    query_limit: usize,
    lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl ProjectionEngine {
    pub(crate) fn new(
        partition: &str,
        storage: Storage,
        protocol: Arc<dyn DynProtocol>,
        batch_size: usize,
        query_limit: usize,
        events: broadcast::Sender<StoreEvent>,
    ) -> StoreResult<Self> {
        storage.ensure_index_table(partition)?;
        debug!(partition, protocol = protocol.name(), "Projection engine ready");

        Ok(Self {
            partition: partition.to_string(),
            table_name: index_table_name(partition),
            db: storage.db_handle(),
            storage,
            protocol,
            batch_size: batch_size.max(1),
            query_limit,
            lock: Mutex::new(()),
            events,
        })
    }

    /// Partition this engine projects
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Name of the protocol driving this projection
    pub fn protocol_name(&self) -> &str {
        self.protocol.name()
    }

    /// Read-only view of the committed index
    pub fn view(&self) -> IndexView {
        IndexView::new(self.db.clone(), self.table_name.clone(), self.query_limit)
    }

    /// Committed consumption cursors
    pub fn cursors(&self) -> StoreResult<BTreeMap<LogKey, u64>> {
        self.storage.load_cursors(&self.partition)
    }

    /// Apply one batch atomically, returning the number of entries consumed
    pub fn apply(&self, batch: &[BatchEntry]) -> StoreResult<usize> {
        let _guard = self.lock.lock();
        let applied = self.apply_locked(batch)?;
        self.applied(applied);
        Ok(applied)
    }

    /// Run `payload` through the protocol against the committed index and
    /// discard the result
    ///
    /// Lets callers refuse an operation before it is written to a log.
    pub fn check(&self, payload: &[u8]) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let db = self.db.read();
        let txn = db.begin_write()?;

        let result = {
            let table = RefCell::new(txn.open_table(index_definition(&self.table_name))?);
            let core = CoreTxn::new(&table, self.query_limit);
            let reader = IndexReader::new(&table, self.query_limit);
            self.protocol.apply_payload(payload, &core, &reader)
        };

        txn.abort()?;
        if let Err(e) = &result {
            debug!(partition = %self.partition, error = %e, "Operation rejected");
        }
        result
    }

    /// Consume everything the inputs hold beyond the committed cursors
    ///
    /// Returns the number of entries applied. A failing batch stops the update
    /// and leaves the index at the last committed batch. If the committed
    /// cursors are no longer a prefix of the replay order the partition is
    /// rebuilt and the number of entries replayed is returned.
    pub fn update(&self, inputs: Vec<LogHandle>) -> StoreResult<usize> {
        let _guard = self.lock.lock();
        let cursors = self.storage.load_cursors(&self.partition)?;

        if !follows_replay(&inputs, &cursors)? {
            info!(partition = %self.partition, "Late entries reorder the index, rebuilding");
            return self.rebuild_locked(inputs);
        }

        let mut merge = CausalMerge::new(inputs, &cursors);

        let mut total = 0;
        loop {
            let batch = merge.next_batch(self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            total += self.apply_locked(&batch)?;
        }

        self.applied(total);
        Ok(total)
    }

    /// Clear the index and replay every input from the start
    ///
    /// The whole replay runs in one write transaction, so readers keep seeing
    /// the previous index until it commits.
    pub fn rebuild(&self, inputs: Vec<LogHandle>) -> StoreResult<usize> {
        let _guard = self.lock.lock();
        self.rebuild_locked(inputs)
    }

    fn rebuild_locked(&self, inputs: Vec<LogHandle>) -> StoreResult<usize> {
        let db = self.db.read();
        let txn = db.begin_write()?;

        match self.replay_all(&txn, inputs) {
            Ok(total) => {
                txn.commit()?;
                info!(partition = %self.partition, entries = total, "Index rebuilt");
                let _ = self.events.send(StoreEvent::Rebuilt {
                    partition: self.partition.clone(),
                    entries: total,
                });
                Ok(total)
            }
            Err(e) => {
                self.abort(txn, &e);
                Err(e)
            }
        }
    }

    fn replay_all(&self, txn: &WriteTransaction, inputs: Vec<LogHandle>) -> StoreResult<usize> {
        txn.delete_table(index_definition(&self.table_name))?;
        let _ = txn.open_table(index_definition(&self.table_name))?;
        clear_cursors(txn, &self.partition)?;

        let mut cursors = BTreeMap::new();
        let mut merge = CausalMerge::new(inputs, &cursors);
        let mut total = 0;
        loop {
            let batch = merge.next_batch(self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            total += self.stage(txn, &batch, &mut cursors)?;
        }
        Ok(total)
    }

    fn apply_locked(&self, batch: &[BatchEntry]) -> StoreResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut cursors = self.storage.load_cursors(&self.partition)?;
        let db = self.db.read();
        let txn = db.begin_write()?;

        match self.stage(&txn, batch, &mut cursors) {
            Ok(applied) => {
                txn.commit()?;
                debug!(partition = %self.partition, applied, "Batch committed");
                Ok(applied)
            }
            Err(e) => {
                self.abort(txn, &e);
                Err(e)
            }
        }
    }

    /// Run a batch through the protocol inside `txn` and stage its cursors
    fn stage(
        &self,
        txn: &WriteTransaction,
        batch: &[BatchEntry],
        cursors: &mut BTreeMap<LogKey, u64>,
    ) -> StoreResult<usize> {
        let mut advanced = BTreeMap::new();
        let mut applied = 0;
        {
            let table = RefCell::new(txn.open_table(index_definition(&self.table_name))?);
            let core = CoreTxn::new(&table, self.query_limit);
            let reader = IndexReader::new(&table, self.query_limit);

            for item in batch {
                let expected = cursors.get(&item.writer).copied().unwrap_or(0);
                if item.seq < expected {
                    debug!(
                        writer = %item.writer.short(),
                        seq = item.seq,
                        "Skipping already consumed entry"
                    );
                    continue;
                }
                if item.seq > expected {
                    return Err(StoreError::OutOfOrder {
                        writer: item.writer,
                        expected,
                        got: item.seq,
                    });
                }

                self.protocol
                    .apply_payload(&item.entry.payload, &core, &reader)?;
                cursors.insert(item.writer, expected + 1);
                advanced.insert(item.writer, expected + 1);
                applied += 1;
            }
        }

        for (writer, consumed) in &advanced {
            write_cursor(txn, &self.partition, writer, *consumed)?;
        }
        Ok(applied)
    }

    fn abort(&self, txn: WriteTransaction, cause: &StoreError) {
        error!(partition = %self.partition, error = %cause, "Batch aborted");
        if let Err(e) = txn.abort() {
            warn!(partition = %self.partition, error = %e, "Failed to abort transaction");
        }
        let _ = self.events.send(StoreEvent::ApplyFailed {
            partition: self.partition.clone(),
            error: cause.to_string(),
        });
    }

    fn applied(&self, entries: usize) {
        if entries > 0 {
            let _ = self.events.send(StoreEvent::Applied {
                partition: self.partition.clone(),
                entries,
            });
        }
    }
}

/// Whether `cursors` mark a point the replay of `inputs` passes through
///
/// The merge is a pure function of its positions, so continuing from such a
/// point yields exactly the replay order.
fn follows_replay(inputs: &[LogHandle], cursors: &BTreeMap<LogKey, u64>) -> StoreResult<bool> {
    let consumed: BTreeMap<LogKey, u64> = cursors
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(k, n)| (*k, *n))
        .collect();
    if consumed
        .keys()
        .any(|key| !inputs.iter().any(|h| h.key() == *key))
    {
        return Ok(false);
    }
    if inputs.len() <= 1 {
        return Ok(true);
    }

    let steps = consumed.values().sum();
    let mut replay = CausalMerge::new(inputs.to_vec(), &BTreeMap::new());
    if replay.advance(steps)? < steps {
        return Ok(false);
    }
    Ok(replay
        .positions()
        .iter()
        .all(|(key, at)| consumed.get(key).copied().unwrap_or(0) == *at))
}
