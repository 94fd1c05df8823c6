//! Reassembling incoming fragments

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{decode_fragment, PacketId};
use crate::error::{StoreError, StoreResult};

struct Pending {
    total: u64,
    fragments: BTreeMap<u64, Vec<u8>>,
    touched: Instant,
}

/// Buffers fragments per packet until every index has arrived
pub struct Merger {
    timeout: Duration,
    pending: HashMap<PacketId, Pending>,
}

impl Merger {
    /// Merger that drops incomplete packets idle for longer than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Accept one fragment; returns the message once it is complete
    ///
    /// A malformed fragment is rejected without disturbing other packets.
    pub fn push(&mut self, frame: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.push_at(frame, Instant::now())
    }

    /// [`push`](Self::push) with an explicit arrival time
    pub fn push_at(&mut self, frame: &[u8], now: Instant) -> StoreResult<Option<Vec<u8>>> {
        let (header, payload) = decode_fragment(frame)?;

        if header.total == 1 {
            return Ok(Some(payload.to_vec()));
        }

        let id = header.packet_id();
        let pending = self.pending.entry(id).or_insert_with(|| Pending {
            total: header.total,
            fragments: BTreeMap::new(),
            touched: now,
        });

        if pending.total != header.total {
            return Err(StoreError::MalformedFrame(format!(
                "Fragment claims {} fragments, packet {}:{} has {}",
                header.total, id.timestamp, id.offset, pending.total
            )));
        }

        pending.touched = now;
        pending
            .fragments
            .entry(header.index)
            .or_insert_with(|| payload.to_vec());

        if pending.fragments.len() as u64 == pending.total {
            if let Some(done) = self.pending.remove(&id) {
                return Ok(Some(done.fragments.into_values().flatten().collect()));
            }
        }
        Ok(None)
    }

    /// Drop packets idle past the timeout, returning how many were dropped
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) as of `now`
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending.retain(|id, pending| {
            let keep = now.saturating_duration_since(pending.touched) <= timeout;
            if !keep {
                let err = StoreError::ReassemblyTimeout {
                    timestamp: id.timestamp,
                    offset: id.offset,
                };
                debug!(
                    received = pending.fragments.len(),
                    total = pending.total,
                    "{}",
                    err
                );
            }
            keep
        });
        before - self.pending.len()
    }

    /// Packets waiting for more fragments
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Configured idle timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
