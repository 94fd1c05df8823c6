//! One replication session per connected peer
//!
//! Outgoing messages go through a dedicated writer task, so a session never
//! stops reading while its peer is pushing entries at it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{WireMessage, MAX_ENTRIES_PER_MESSAGE};
use crate::error::{StoreError, StoreResult};
use crate::events::StoreEvent;
use crate::framing::{frame_reader, FrameSink, Merger};
use crate::gossip::GossipExtension;
use crate::log::LogStore;
use crate::swarm::PeerConnection;
use crate::topology::TopologyManager;
use crate::types::{LogKey, Topic};

/// Time allowed for the peer's handshake to arrive
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a session needs from its store
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub topic: Topic,
    pub private: bool,
    pub logs: LogStore,
    pub topology: Arc<TopologyManager>,
    pub gossip: GossipExtension,
    pub max_chunk_size: usize,
    pub reassembly_timeout: Duration,
    pub events: broadcast::Sender<StoreEvent>,
}

/// Per-session replication bookkeeping
#[derive(Default)]
struct PeerState {
    /// Lengths the peer has announced
    remote_lengths: HashMap<LogKey, u64>,
    /// Outstanding requests: key to the `from` asked for
    requested: HashMap<LogKey, u64>,
}

/// Drive a session until the peer disconnects or the stream fails
pub(crate) async fn run_session(ctx: SessionContext, conn: PeerConnection) -> StoreResult<()> {
    let PeerConnection {
        peer,
        reader,
        writer,
    } = conn;

    let mut frames = frame_reader(reader, ctx.max_chunk_size);
    let mut merger = Merger::new(ctx.reassembly_timeout);

    let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(write_loop(
        FrameSink::new(writer, ctx.max_chunk_size),
        outgoing_rx,
    ));

    let result: StoreResult<()> = async {
        send(
            &outgoing,
            &WireMessage::Handshake {
                topic: ctx.topic,
                private: ctx.private,
            },
        )?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match frames.next().await {
                    Some(Ok(frame)) => match merger.push(&frame) {
                        Ok(Some(bytes)) => return WireMessage::decode(&bytes).map(Some),
                        Ok(None) => continue,
                        Err(e) => warn!(%peer, error = %e, "Dropping malformed frame"),
                    },
                    Some(Err(e)) => return Err(StoreError::Network(format!("Read error: {}", e))),
                    None => return Ok(None),
                }
            }
        })
        .await
        .map_err(|_| StoreError::Network("Handshake timed out".to_string()))??;

        match first {
            Some(WireMessage::Handshake { topic, private }) => {
                if topic != ctx.topic {
                    return Err(StoreError::AccessDenied(format!(
                        "peer {} replicates a different store",
                        peer
                    )));
                }
                if private {
                    return Err(StoreError::AccessDenied(format!("peer {} is private", peer)));
                }
            }
            Some(other) => {
                return Err(StoreError::Network(format!(
                    "Expected handshake, got {:?}",
                    other
                )))
            }
            None => return Err(StoreError::Network("Peer closed before handshake".to_string())),
        }

        info!(%peer, "Peer connected");
        let _ = ctx.events.send(StoreEvent::PeerConnected {
            peer_id: peer.clone(),
        });

        let outcome = replicate(&ctx, &peer, &mut frames, &mut merger, &outgoing).await;

        info!(%peer, "Peer disconnected");
        let _ = ctx.events.send(StoreEvent::PeerDisconnected {
            peer_id: peer.clone(),
        });
        outcome
    }
    .await;

    drop(outgoing);
    match writer_task.await {
        Ok(Err(e)) => debug!(%peer, error = %e, "Writer task ended with error"),
        Err(e) => debug!(%peer, error = %e, "Writer task panicked"),
        Ok(Ok(())) => {}
    }

    if let Err(e) = &result {
        warn!(%peer, error = %e, "Session ended");
    }
    result
}

async fn replicate<R>(
    ctx: &SessionContext,
    peer: &str,
    frames: &mut R,
    merger: &mut Merger,
    outgoing: &mpsc::UnboundedSender<Vec<u8>>,
) -> StoreResult<()>
where
    R: futures::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
    // Subscribe first so appends made while announcing are not missed
    let mut appends = ctx.logs.subscribe();
    let mut state = PeerState::default();

    for announcement in ctx.gossip.announcements() {
        send(outgoing, &announcement)?;
    }
    announce_lengths(ctx, outgoing)?;

    let mut sweep = tokio::time::interval(ctx.reassembly_timeout.max(Duration::from_millis(10)));
    sweep.tick().await;

    loop {
        tokio::select! {
            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(StoreError::Network(format!("Read error: {}", e))),
                    None => return Ok(()),
                };
                let bytes = match merger.push(&frame) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%peer, error = %e, "Dropping malformed frame");
                        continue;
                    }
                };
                match WireMessage::decode(&bytes) {
                    Ok(msg) => handle_message(ctx, peer, &mut state, msg, outgoing)?,
                    Err(e) => warn!(%peer, error = %e, "Dropping undecodable message"),
                }
            }

            appended = appends.recv() => match appended {
                Ok(key) => send(outgoing, &WireMessage::Have {
                    key,
                    length: ctx.logs.length(&key),
                })?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%peer, skipped, "Append notifications lagged, re-announcing");
                    announce_lengths(ctx, outgoing)?;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },

            _ = sweep.tick() => {
                let dropped = merger.sweep();
                if dropped > 0 {
                    debug!(%peer, dropped, "Dropped expired partial packets");
                }
            }
        }
    }
}

fn handle_message(
    ctx: &SessionContext,
    peer: &str,
    state: &mut PeerState,
    msg: WireMessage,
    outgoing: &mpsc::UnboundedSender<Vec<u8>>,
) -> StoreResult<()> {
    match msg {
        WireMessage::Handshake { .. } => {
            debug!(%peer, "Ignoring repeated handshake");
        }

        WireMessage::Writers { partition, keys } => {
            for key in ctx.gossip.on_writers(&partition, &keys) {
                request_missing(ctx, state, key, outgoing)?;
            }
        }

        WireMessage::Have { key, length } => {
            state.remote_lengths.insert(key, length);
            request_missing(ctx, state, key, outgoing)?;
        }

        WireMessage::Request { key, from } => {
            let entries = ctx.logs.raw_range(&key, from, MAX_ENTRIES_PER_MESSAGE);
            if !entries.is_empty() {
                debug!(%peer, log = %key.short(), from, count = entries.len(), "Serving entries");
                send(
                    outgoing,
                    &WireMessage::Entries {
                        key,
                        start: from,
                        entries,
                    },
                )?;
            }
        }

        WireMessage::Entries {
            key,
            start,
            entries,
        } => {
            state.requested.remove(&key);
            if !ctx.topology.wants_entries(&key) {
                debug!(%peer, log = %key.short(), "Ignoring entries for an unwanted log");
                return Ok(());
            }
            let received = entries.len() as u64;
            ctx.logs.put_replica(&key, start, entries)?;
            let remote = state.remote_lengths.entry(key).or_insert(0);
            *remote = (*remote).max(start + received);
            request_missing(ctx, state, key, outgoing)?;
        }
    }
    Ok(())
}

/// Ask for the entries of `key` the peer has and we lack
fn request_missing(
    ctx: &SessionContext,
    state: &mut PeerState,
    key: LogKey,
    outgoing: &mpsc::UnboundedSender<Vec<u8>>,
) -> StoreResult<()> {
    if ctx.logs.is_writable(&key) || !ctx.topology.wants_entries(&key) {
        return Ok(());
    }

    let held = ctx.logs.length(&key);
    // Writers learned through gossip have no announced length yet
    let behind = state
        .remote_lengths
        .get(&key)
        .map_or(true, |remote| *remote > held);
    if !behind || state.requested.get(&key) == Some(&held) {
        return Ok(());
    }

    state.requested.insert(key, held);
    send(outgoing, &WireMessage::Request { key, from: held })
}

/// Send `Have` for every log worth replicating
fn announce_lengths(ctx: &SessionContext, outgoing: &mpsc::UnboundedSender<Vec<u8>>) -> StoreResult<()> {
    let mut keys: Vec<LogKey> = ctx
        .topology
        .partitions()
        .iter()
        .filter_map(|p| ctx.topology.gossip_keys(p).ok())
        .flatten()
        .collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let length = ctx.logs.length(&key);
        if length > 0 {
            send(outgoing, &WireMessage::Have { key, length })?;
        }
    }
    Ok(())
}

fn send(outgoing: &mpsc::UnboundedSender<Vec<u8>>, msg: &WireMessage) -> StoreResult<()> {
    outgoing
        .send(msg.encode()?)
        .map_err(|_| StoreError::Network("Session writer closed".to_string()))
}

async fn write_loop<W>(
    mut sink: FrameSink<W>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) -> StoreResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        sink.send(&message).await?;
    }
    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::swarm::{MemoryHub, Swarm};
    use crate::topology::AddOptions;
    use tempfile::TempDir;

    struct Node {
        ctx: SessionContext,
        events: broadcast::Receiver<StoreEvent>,
        _dir: TempDir,
    }

    fn node(name: &str, private: bool) -> Node {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let logs = LogStore::open(storage.clone()).unwrap();
        let (tx, rx) = broadcast::channel(64);
        let topology = Arc::new(TopologyManager::new(logs.clone(), storage, tx.clone()));
        topology.add_partition("default", None).unwrap();
        Node {
            ctx: SessionContext {
                topic: Topic::for_store(name),
                private,
                logs,
                gossip: GossipExtension::new(topology.clone()),
                topology,
                max_chunk_size: 64,
                reassembly_timeout: Duration::from_secs(5),
                events: tx,
            },
            events: rx,
            _dir: dir,
        }
    }

    async fn connect(a: &Node, b: &Node) -> (tokio::task::JoinHandle<StoreResult<()>>, tokio::task::JoinHandle<StoreResult<()>>) {
        let hub = MemoryHub::new();
        let topic = Topic::for_store("pair");
        let mut rx_a = hub.swarm("a").join(topic).unwrap();
        let mut rx_b = hub.swarm("b").join(topic).unwrap();
        let conn_a = rx_a.recv().await.unwrap();
        let conn_b = rx_b.recv().await.unwrap();
        (
            tokio::spawn(run_session(a.ctx.clone(), conn_a)),
            tokio::spawn(run_session(b.ctx.clone(), conn_b)),
        )
    }

    async fn wait_for_length(logs: &LogStore, key: &LogKey, length: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while logs.length(key) < length {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replication timed out");
    }

    #[tokio::test]
    async fn test_gossip_and_entries_flow_between_peers() {
        let a = node("shared", false);
        let b = node("shared", false);

        let writer_a = a.ctx.topology.local_writer("default").unwrap();
        for i in 0..300u32 {
            writer_a.append(&i.to_be_bytes()).unwrap();
        }

        let (_sa, _sb) = connect(&a, &b).await;
        wait_for_length(&b.ctx.logs, &writer_a.key(), 300).await;
        assert!(b.ctx.topology.knows_writer("default", &writer_a.key()).unwrap());

        writer_a.append(b"live").unwrap();
        wait_for_length(&b.ctx.logs, &writer_a.key(), 301).await;
        assert_eq!(
            b.ctx.logs.raw_range(&writer_a.key(), 300, 1),
            a.ctx.logs.raw_range(&writer_a.key(), 300, 1)
        );
    }

    #[tokio::test]
    async fn test_connected_event_is_emitted() {
        let a = node("shared", false);
        let mut b = node("shared", false);
        let (_sa, _sb) = connect(&a, &b).await;

        let event = tokio::time::timeout(Duration::from_secs(5), b.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StoreEvent::PeerConnected { peer_id } if peer_id == "a"));
    }

    #[tokio::test]
    async fn test_topic_mismatch_is_denied() {
        let a = node("one", false);
        let b = node("two", false);
        let (sa, sb) = connect(&a, &b).await;

        assert!(matches!(sa.await.unwrap(), Err(StoreError::AccessDenied(_))));
        assert!(matches!(sb.await.unwrap(), Err(StoreError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_private_peer_is_denied() {
        let a = node("shared", true);
        let b = node("shared", false);
        let (_sa, sb) = connect(&a, &b).await;
        assert!(matches!(sb.await.unwrap(), Err(StoreError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_destroyed_writer_is_not_fetched() {
        let a = node("shared", false);
        let b = node("shared", false);
        let key_a = a.ctx.topology.local_writer("default").unwrap().key();
        a.ctx
            .topology
            .local_writer("default")
            .unwrap()
            .append(b"x")
            .unwrap();
        b.ctx
            .topology
            .add_writer("default", key_a, AddOptions::default())
            .unwrap();
        b.ctx
            .topology
            .remove_writer("default", key_a, crate::topology::RemoveOptions::destroy())
            .unwrap();

        let (_sa, _sb) = connect(&a, &b).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(b.ctx.logs.length(&key_a), 0);
    }
}
