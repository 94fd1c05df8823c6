//! Carrying fragments over byte streams
//!
//! Each fragment becomes one length-prefixed frame, so the reader always
//! hands the [`Merger`](super::Merger) whole fragments.

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{Splitter, MAX_HEADER_SIZE};
use crate::error::{StoreError, StoreResult};

/// Length-delimited codec sized for fragments of `max_chunk_size` payload
pub fn codec(max_chunk_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_chunk_size.max(1) + MAX_HEADER_SIZE)
        .new_codec()
}

/// Framed reader yielding one fragment per item
pub fn frame_reader<R: AsyncRead>(reader: R, max_chunk_size: usize) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(reader, codec(max_chunk_size))
}

/// Writes messages as fragments onto a byte stream
pub struct FrameSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    splitter: Splitter,
}

impl<W: AsyncWrite + Unpin> FrameSink<W> {
    /// Sink splitting messages into `max_chunk_size` payloads
    pub fn new(writer: W, max_chunk_size: usize) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec(max_chunk_size)),
            splitter: Splitter::new(max_chunk_size),
        }
    }

    /// Split and send one message
    pub async fn send(&mut self, message: &[u8]) -> StoreResult<()> {
        for frame in self.splitter.split(message)? {
            self.inner
                .feed(frame)
                .await
                .map_err(|e| StoreError::Network(format!("Send error: {}", e)))?;
        }
        SinkExt::<Bytes>::flush(&mut self.inner)
            .await
            .map_err(|e| StoreError::Network(format!("Flush error: {}", e)))
    }

    /// Flush and close the underlying writer
    pub async fn close(mut self) -> StoreResult<()> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| StoreError::Network(format!("Close error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Merger;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_messages_survive_a_byte_stream() {
        let (client, server) = tokio::io::duplex(64);
        let mut sink = FrameSink::new(client, 16);
        let mut frames = frame_reader(server, 16);
        let mut merger = Merger::new(Duration::from_secs(5));

        let big: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let writer = tokio::spawn(async move {
            sink.send(b"hello").await.unwrap();
            sink.send(&big).await.unwrap();
            sink.send(&[]).await.unwrap();
            sink.close().await.unwrap();
            big
        });

        let mut received = Vec::new();
        while let Some(frame) = frames.next().await {
            if let Some(message) = merger.push(&frame.unwrap()).unwrap() {
                received.push(message);
            }
        }
        let big = writer.await.unwrap();

        assert_eq!(received, vec![b"hello".to_vec(), big, Vec::new()]);
        assert_eq!(merger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_by_reader() {
        let (client, server) = tokio::io::duplex(1024);
        // writer allows far larger frames than the reader
        let mut sink = FramedWrite::new(client, codec(512));
        let mut frames = frame_reader(server, 8);

        sink.send(bytes::Bytes::from(vec![0u8; 200])).await.unwrap();
        assert!(frames.next().await.unwrap().is_err());
    }
}
