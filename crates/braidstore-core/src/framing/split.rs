//! Fragmenting outgoing messages

use bytes::Bytes;

use super::{encode_fragment, FrameHeader, MAX_OFFSET};
use crate::error::StoreResult;

/// Cuts messages into fragments of at most `chunk_size` payload bytes
#[derive(Debug)]
pub struct Splitter {
    chunk_size: usize,
    last_timestamp: Option<u64>,
    offset: u64,
}

impl Splitter {
    /// Splitter for the given chunk size (at least one byte)
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            last_timestamp: None,
            offset: 0,
        }
    }

    /// Payload bytes per fragment
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split using the current wall-clock millisecond
    pub fn split(&mut self, data: &[u8]) -> StoreResult<Vec<Bytes>> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.split_at(data, now_ms)
    }

    /// Split as if the clock read `now_ms`
    ///
    /// Always yields `max(1, ceil(len / chunk_size))` fragments, so an empty
    /// message still travels as one empty fragment.
    pub fn split_at(&mut self, data: &[u8], now_ms: u64) -> StoreResult<Vec<Bytes>> {
        let offset = self.next_offset(now_ms);
        let total = data.len().div_ceil(self.chunk_size).max(1) as u64;

        let mut frames = Vec::with_capacity(total as usize);
        for index in 0..total {
            let start = (index as usize) * self.chunk_size;
            let end = (start + self.chunk_size).min(data.len());
            let header = FrameHeader {
                timestamp: now_ms,
                offset,
                total,
                index,
            };
            frames.push(Bytes::from(encode_fragment(&header, &data[start..end])?));
        }
        Ok(frames)
    }

    fn next_offset(&mut self, now_ms: u64) -> u64 {
        if self.last_timestamp != Some(now_ms) {
            self.last_timestamp = Some(now_ms);
            self.offset = 0;
        } else {
            self.offset += 1;
            if self.offset > MAX_OFFSET {
                self.offset = 0;
            }
        }
        self.offset
    }
}
