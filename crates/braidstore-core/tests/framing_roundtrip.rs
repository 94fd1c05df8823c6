//! Split/merge framing properties
//!
//! Messages of up to ten chunks are split and reassembled for chunk sizes of
//! 1, 16 and 1024 bytes, in order and out of order.

use std::time::Duration;

use braidstore_core::framing::{decode_fragment, frame_reader};
use braidstore_core::{FrameSink, Merger, Splitter};
use futures::StreamExt;
use proptest::prelude::*;

const NOW_MS: u64 = 1_700_000_000_000;

// ============================================================================
// Strategy Generators
// ============================================================================

/// A chunk size and a message of at most ten chunks
fn message_strategy() -> impl Strategy<Value = (usize, Vec<u8>)> {
    prop_oneof![Just(1usize), Just(16usize), Just(1024usize)].prop_flat_map(|chunk| {
        (
            Just(chunk),
            prop::collection::vec(any::<u8>(), 0..=10 * chunk),
        )
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Fragments delivered in order rebuild the original message
    #[test]
    fn split_then_merge_roundtrips((chunk, data) in message_strategy()) {
        let mut splitter = Splitter::new(chunk);
        let frames = splitter.split_at(&data, NOW_MS).unwrap();
        prop_assert_eq!(frames.len(), data.len().div_ceil(chunk).max(1));

        let mut merger = Merger::new(Duration::from_secs(30));
        let mut result = None;
        for (i, frame) in frames.iter().enumerate() {
            let out = merger.push(frame).unwrap();
            if i + 1 < frames.len() {
                prop_assert!(out.is_none());
            } else {
                result = out;
            }
        }
        prop_assert_eq!(result, Some(data));
        prop_assert_eq!(merger.pending_count(), 0);
    }

    /// Delivery order does not matter
    #[test]
    fn reversed_delivery_roundtrips((chunk, data) in message_strategy()) {
        let mut splitter = Splitter::new(chunk);
        let frames = splitter.split_at(&data, NOW_MS).unwrap();

        let mut merger = Merger::new(Duration::from_secs(30));
        let mut result = None;
        for frame in frames.iter().rev() {
            if let Some(out) = merger.push(frame).unwrap() {
                result = Some(out);
            }
        }
        prop_assert_eq!(result, Some(data));
    }

    /// Every fragment carries a consistent header
    #[test]
    fn headers_are_consistent((chunk, data) in message_strategy()) {
        let mut splitter = Splitter::new(chunk);
        let frames = splitter.split_at(&data, NOW_MS).unwrap();
        let total = frames.len() as u64;

        for (i, frame) in frames.iter().enumerate() {
            let (header, payload) = decode_fragment(frame).unwrap();
            prop_assert_eq!(header.timestamp, NOW_MS);
            prop_assert_eq!(header.total, total);
            prop_assert_eq!(header.index, i as u64);
            prop_assert!(payload.len() <= chunk);
        }
    }
}

// ============================================================================
// Interleaving and Timeouts
// ============================================================================

#[test]
fn test_interleaved_packets_reassemble_independently() {
    let mut splitter = Splitter::new(4);
    let first = splitter.split_at(b"first message", NOW_MS).unwrap();
    let second = splitter.split_at(b"second message", NOW_MS).unwrap();

    let mut merger = Merger::new(Duration::from_secs(30));
    let mut done = Vec::new();
    for (a, b) in first.iter().zip(second.iter()) {
        done.extend(merger.push(a).unwrap());
        done.extend(merger.push(b).unwrap());
    }
    for frame in second.iter().skip(first.len()) {
        done.extend(merger.push(frame).unwrap());
    }

    assert_eq!(done, vec![b"first message".to_vec(), b"second message".to_vec()]);
}

#[test]
fn test_malformed_fragment_does_not_disturb_others() {
    let mut splitter = Splitter::new(4);
    let frames = splitter.split_at(b"abcdefgh", NOW_MS).unwrap();

    let mut merger = Merger::new(Duration::from_secs(30));
    assert!(merger.push(&frames[0]).unwrap().is_none());
    assert!(merger.push(&[0xff, 0xff]).is_err());
    assert_eq!(merger.push(&frames[1]).unwrap(), Some(b"abcdefgh".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_packet_is_swept_after_timeout() {
    let timeout = Duration::from_secs(30);
    let mut splitter = Splitter::new(4);
    let frames = splitter.split_at(b"needs two", NOW_MS).unwrap();
    assert!(frames.len() > 1);

    let mut merger = Merger::new(timeout);
    assert!(merger.push(&frames[0]).unwrap().is_none());
    assert_eq!(merger.pending_count(), 1);

    tokio::time::advance(timeout - Duration::from_millis(1)).await;
    assert_eq!(merger.sweep(), 0);
    assert_eq!(merger.pending_count(), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(merger.sweep(), 1);
    assert_eq!(merger.pending_count(), 0);
}

#[tokio::test]
async fn test_large_message_over_byte_stream() {
    let chunk = 1024;
    let (client, server) = tokio::io::duplex(4096);
    let message: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

    let expected = message.clone();
    let reader = tokio::spawn(async move {
        let mut frames = frame_reader(server, chunk);
        let mut merger = Merger::new(Duration::from_secs(30));
        while let Some(frame) = frames.next().await {
            if let Some(done) = merger.push(&frame.unwrap()).unwrap() {
                return done;
            }
        }
        panic!("stream ended before the message completed");
    });

    let mut sink = FrameSink::new(client, chunk);
    sink.send(&message).await.unwrap();
    sink.close().await.unwrap();

    assert_eq!(reader.await.unwrap(), expected);
}
