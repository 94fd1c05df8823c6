//! Split/merge framing for size-constrained transports
//!
//! Messages larger than the transport's chunk size are cut into fragments,
//! each prefixed with a small header:
//!
//! ```text
//! +--------------+--------+-------+-------+-------------------+
//! | timestamp_ms | offset | total | index | payload (<= C)    |
//! +--------------+--------+-------+-------+-------------------+
//!   varint         varint   varint  varint
//! ```
//!
//! `(timestamp_ms, offset)` identifies the packet. The [`Splitter`] hands out
//! ids; the [`Merger`] buffers fragments per id until all `total` indexes are
//! present, then yields the payloads concatenated in index order.
//!
//! On a byte stream every fragment is carried as one length-delimited frame
//! (see [`FrameSink`] and [`frame_reader`]).

mod merge;
mod split;
mod stream;

pub use merge::Merger;
pub use split::Splitter;
pub use stream::{codec, frame_reader, FrameSink};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Offsets wrap to zero after this many packets within one millisecond
pub const MAX_OFFSET: u64 = 10_000;

/// Upper bound on the encoded size of a [`FrameHeader`] (four u64 varints)
pub const MAX_HEADER_SIZE: usize = 40;

/// Identifier shared by every fragment of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId {
    /// Millisecond the packet was split
    pub timestamp: u64,
    /// Disambiguates packets split within the same millisecond
    pub offset: u64,
}

/// Header prepended to every fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Millisecond timestamp half of the packet id
    pub timestamp: u64,
    /// Offset half of the packet id
    pub offset: u64,
    /// Number of fragments in the packet
    pub total: u64,
    /// Position of this fragment
    pub index: u64,
}

impl FrameHeader {
    /// Packet this fragment belongs to
    pub fn packet_id(&self) -> PacketId {
        PacketId {
            timestamp: self.timestamp,
            offset: self.offset,
        }
    }
}

/// Build one fragment: header followed by payload
pub(crate) fn encode_fragment(header: &FrameHeader, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let mut out = postcard::to_allocvec(header)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a fragment into its validated header and payload
pub fn decode_fragment(frame: &[u8]) -> StoreResult<(FrameHeader, &[u8])> {
    let (header, payload) = postcard::take_from_bytes::<FrameHeader>(frame)
        .map_err(|e| StoreError::MalformedFrame(format!("Undecodable header: {}", e)))?;

    if header.total == 0 {
        return Err(StoreError::MalformedFrame("Packet with zero fragments".into()));
    }
    if header.index >= header.total {
        return Err(StoreError::MalformedFrame(format!(
            "Fragment index {} out of range for {} fragments",
            header.index, header.total
        )));
    }
    Ok((header, payload))
}
