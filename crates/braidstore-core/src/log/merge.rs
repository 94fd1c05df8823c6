//! Causal merge of several writer logs into one ordered stream
//!
//! Each step considers the next unconsumed entry (the "head") of every input
//! log, in ascending key order, and emits the first head whose clock is
//! satisfied by what has already been emitted. Dependencies on logs outside
//! the input set are ignored, and a dependency reaching past a frozen
//! snapshot is capped at the snapshot length.
//!
//! A head depending on entries that have not been replicated yet stops the
//! merge: nothing more is emitted until those entries arrive, so every
//! replica emits the same sequence. Only when all dependencies are held but
//! none is satisfied (clocks form a cycle) does the smallest key win.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use super::{Entry, LogHandle};
use crate::error::{StoreError, StoreResult};
use crate::types::LogKey;

/// One merged entry, tagged with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Writer log the entry belongs to
    pub writer: LogKey,
    /// Position of the entry in that log
    pub seq: u64,
    /// Decoded entry
    pub entry: Entry,
}

/// How far a writer head is from being emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    /// Every dependency has been emitted
    Ready,
    /// A dependency is held but not emitted yet
    Blocked,
    /// A dependency has not been replicated yet
    Waiting,
}

/// Deterministic merge over a fixed set of input logs
pub struct CausalMerge {
    inputs: BTreeMap<LogKey, LogHandle>,
    positions: BTreeMap<LogKey, u64>,
    heads: HashMap<LogKey, Entry>,
}

impl CausalMerge {
    /// Start merging `inputs`, skipping what `cursors` marks as consumed
    pub fn new(inputs: Vec<LogHandle>, cursors: &BTreeMap<LogKey, u64>) -> Self {
        let inputs: BTreeMap<LogKey, LogHandle> =
            inputs.into_iter().map(|h| (h.key(), h)).collect();
        let positions = inputs
            .keys()
            .map(|k| (*k, cursors.get(k).copied().unwrap_or(0)))
            .collect();

        Self {
            inputs,
            positions,
            heads: HashMap::new(),
        }
    }

    /// Next consumption position of every input
    pub fn positions(&self) -> &BTreeMap<LogKey, u64> {
        &self.positions
    }

    /// Whether every input has been fully consumed
    pub fn is_drained(&self) -> bool {
        self.inputs
            .iter()
            .all(|(k, h)| self.positions.get(k).copied().unwrap_or(0) >= h.len())
    }

    /// Emit up to `max` entries in causal order
    pub fn next_batch(&mut self, max: usize) -> StoreResult<Vec<BatchEntry>> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.next_entry()? {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Consume up to `steps` entries without returning them
    ///
    /// Returns the number of entries consumed.
    pub fn advance(&mut self, steps: u64) -> StoreResult<u64> {
        let mut taken = 0;
        while taken < steps {
            if self.next_entry()?.is_none() {
                break;
            }
            taken += 1;
        }
        Ok(taken)
    }

    fn next_entry(&mut self) -> StoreResult<Option<BatchEntry>> {
        let pending: Vec<LogKey> = self
            .inputs
            .iter()
            .filter(|(k, h)| self.positions[*k] < h.len())
            .map(|(k, _)| *k)
            .collect();

        let Some(&fallback) = pending.first() else {
            return Ok(None);
        };

        let mut chosen = None;
        let mut waiting = false;
        for key in &pending {
            self.load_head(key)?;
            match self.head_state(key) {
                HeadState::Ready => {
                    chosen = Some(*key);
                    break;
                }
                HeadState::Blocked => {}
                HeadState::Waiting => waiting = true,
            }
        }

        let writer = match chosen {
            Some(key) => key,
            None if waiting => {
                debug!(pending = pending.len(), "Waiting for dependencies to replicate");
                return Ok(None);
            }
            None => {
                warn!(
                    writer = %fallback.short(),
                    "Writer clocks form a cycle, emitting smallest key"
                );
                fallback
            }
        };

        let seq = self.positions[&writer];
        let entry = match self.heads.remove(&writer) {
            Some(entry) => entry,
            None => self.read_entry(&writer, seq)?,
        };
        self.positions.insert(writer, seq + 1);

        Ok(Some(BatchEntry { writer, seq, entry }))
    }

    fn head_state(&self, key: &LogKey) -> HeadState {
        let Some(head) = self.heads.get(key) else {
            return HeadState::Waiting;
        };

        let mut state = HeadState::Ready;
        for (dep, needed) in &head.clock {
            if dep == key {
                continue;
            }
            let Some(handle) = self.inputs.get(dep) else {
                continue;
            };
            let needed = match handle.snapshot_length() {
                Some(frozen) => (*needed).min(frozen),
                None => *needed,
            };
            if self.positions[dep] >= needed {
                continue;
            }
            if handle.len() < needed {
                return HeadState::Waiting;
            }
            state = HeadState::Blocked;
        }
        state
    }

    fn load_head(&mut self, key: &LogKey) -> StoreResult<()> {
        if self.heads.contains_key(key) {
            return Ok(());
        }
        let seq = self.positions[key];
        let entry = self.read_entry(key, seq)?;
        self.heads.insert(*key, entry);
        Ok(())
    }

    fn read_entry(&self, key: &LogKey, seq: u64) -> StoreResult<Entry> {
        let handle = self
            .inputs
            .get(key)
            .ok_or_else(|| StoreError::Storage(format!("No input log {}", key.short())))?;
        let bytes = handle.get(seq)?.ok_or_else(|| {
            StoreError::Storage(format!("Missing entry {} of log {}", seq, key.short()))
        })?;
        Entry::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogOptions, LogStore};
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn create_log_store() -> (LogStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (LogStore::open(storage).unwrap(), temp_dir)
    }

    fn append(log: &LogHandle, payload: u8, clock: Vec<(LogKey, u64)>) {
        let entry = Entry::new(vec![payload]).with_clock(clock);
        log.append(&entry.encode().unwrap()).unwrap();
    }

    /// Two named logs ordered so that `.0 < .1`
    fn ordered_pair(logs: &LogStore) -> (LogHandle, LogHandle) {
        let a = logs.get(LogOptions::named("a")).unwrap();
        let b = logs.get(LogOptions::named("b")).unwrap();
        if a.key() < b.key() {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn payloads(batch: &[BatchEntry]) -> Vec<u8> {
        batch.iter().map(|e| e.entry.payload[0]).collect()
    }

    #[test]
    fn test_independent_logs_merge_by_key_order() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        append(&low, 1, vec![]);
        append(&low, 2, vec![]);
        append(&high, 3, vec![]);

        let mut merge = CausalMerge::new(vec![high.clone(), low.clone()], &BTreeMap::new());
        let batch = merge.next_batch(10).unwrap();
        assert_eq!(payloads(&batch), vec![1, 2, 3]);
        assert!(merge.is_drained());
    }

    #[test]
    fn test_dependency_delays_smaller_key() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        append(&high, 1, vec![]);
        // low was written after seeing high's first entry
        append(&low, 2, vec![(high.key(), 1)]);

        let mut merge = CausalMerge::new(vec![low, high], &BTreeMap::new());
        assert_eq!(payloads(&merge.next_batch(10).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_cursors_skip_consumed_entries() {
        let (logs, _dir) = create_log_store();
        let (low, _) = ordered_pair(&logs);
        append(&low, 1, vec![]);
        append(&low, 2, vec![]);

        let cursors = BTreeMap::from([(low.key(), 1)]);
        let mut merge = CausalMerge::new(vec![low], &cursors);
        let batch = merge.next_batch(10).unwrap();
        assert_eq!(payloads(&batch), vec![2]);
        assert_eq!(batch[0].seq, 1);
    }

    #[test]
    fn test_dependency_outside_inputs_is_ignored() {
        let (logs, _dir) = create_log_store();
        let (low, _) = ordered_pair(&logs);
        append(&low, 1, vec![(LogKey::from_bytes([0xee; 32]), 5)]);

        let mut merge = CausalMerge::new(vec![low], &BTreeMap::new());
        assert_eq!(merge.next_batch(10).unwrap().len(), 1);
    }

    #[test]
    fn test_dependency_capped_by_snapshot() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        append(&high, 1, vec![]);
        append(&high, 2, vec![]);
        append(&low, 3, vec![(high.key(), 2)]);

        let frozen = high.snapshot_at(1);
        let mut merge = CausalMerge::new(vec![low, frozen], &BTreeMap::new());
        assert_eq!(payloads(&merge.next_batch(10).unwrap()), vec![1, 3]);
    }

    #[test]
    fn test_unreplicated_dependency_stops_the_merge() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        // high depends on an entry of low that has not arrived yet
        append(&high, 2, vec![(low.key(), 1)]);

        let mut merge = CausalMerge::new(vec![low.clone(), high.clone()], &BTreeMap::new());
        assert!(merge.next_batch(10).unwrap().is_empty());
        assert!(!merge.is_drained());

        append(&low, 1, vec![]);
        let mut merge = CausalMerge::new(vec![low, high], &BTreeMap::new());
        assert_eq!(payloads(&merge.next_batch(10).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_waiting_head_holds_back_dependents() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        let missing = logs.get(LogOptions::key(LogKey::from_bytes([0xff; 32]))).unwrap();
        append(&high, 1, vec![]);
        append(&high, 2, vec![(missing.key(), 1)]);
        // low saw both entries of high
        append(&low, 3, vec![(high.key(), 2)]);

        let mut merge = CausalMerge::new(vec![low, high, missing], &BTreeMap::new());
        assert_eq!(payloads(&merge.next_batch(10).unwrap()), vec![1]);
        assert!(merge.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_frozen_dependency_waits_for_replication() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        append(&low, 3, vec![(high.key(), 1)]);

        // frozen at one entry that has not been replicated yet
        let frozen = high.snapshot_at(1);
        let mut merge = CausalMerge::new(vec![low, frozen], &BTreeMap::new());
        assert!(merge.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_advance_skips_entries() {
        let (logs, _dir) = create_log_store();
        let (low, _) = ordered_pair(&logs);
        for i in 0..3 {
            append(&low, i, vec![]);
        }

        let mut merge = CausalMerge::new(vec![low.clone()], &BTreeMap::new());
        assert_eq!(merge.advance(2).unwrap(), 2);
        assert_eq!(merge.positions()[&low.key()], 2);
        assert_eq!(merge.advance(5).unwrap(), 1);
    }

    #[test]
    fn test_cycle_falls_back_to_smallest_key() {
        let (logs, _dir) = create_log_store();
        let (low, high) = ordered_pair(&logs);
        append(&low, 1, vec![(high.key(), 1)]);
        append(&high, 2, vec![(low.key(), 1)]);

        let mut merge = CausalMerge::new(vec![low, high], &BTreeMap::new());
        assert_eq!(payloads(&merge.next_batch(10).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_batches_respect_max() {
        let (logs, _dir) = create_log_store();
        let (low, _) = ordered_pair(&logs);
        for i in 0..5 {
            append(&low, i, vec![]);
        }

        let mut merge = CausalMerge::new(vec![low], &BTreeMap::new());
        assert_eq!(merge.next_batch(2).unwrap().len(), 2);
        assert_eq!(merge.next_batch(2).unwrap().len(), 2);
        assert_eq!(merge.next_batch(2).unwrap().len(), 1);
        assert!(merge.next_batch(2).unwrap().is_empty());
    }
}
