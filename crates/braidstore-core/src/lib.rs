//! braidstore Core Library
//!
//! Multi-writer append-only logs projected into a replicated key-value index.
//!
//! ## Overview
//!
//! Every participant owns one append-only writer log per partition. A
//! deterministic protocol plugin replays the union of all known writer logs,
//! in causal order, into a materialized index stored in redb. Peers exchange
//! their logs over a swarm and discover each other's writers through gossip,
//! so every replica converges on the same index without a coordinator.
//!
//! ```text
//! ┌──────────┐  append  ┌────────────┐ merge ┌──────────────────┐ apply ┌───────┐
//! │  Store   │ ───────▶ │ writer log │ ────▶ │ ProjectionEngine │ ────▶ │ index │
//! └──────────┘          └────────────┘       └──────────────────┘       └───────┘
//!       │                     ▲
//!       │ connect             │ Entries
//!       ▼                     │
//! ┌──────────┐  framed  ┌────────────┐
//! │  Swarm   │ ───────▶ │  session   │ ◀── gossip (Writers)
//! └──────────┘          └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use braidstore_core::{ProtocolSet, Store, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::new("garden", "~/.braidstore/garden");
//!     let store = Store::open(config, ProtocolSet::new().with(MyProtocol)).await?;
//!
//!     store.append("default", &MyOp::Set { key: "k".into(), value: "v".into() })?;
//!     println!("{:?}", store.get("default", "k")?);
//!
//!     store.close().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod framing;
pub mod gossip;
pub mod index;
pub mod log;
pub mod projection;
pub mod protocol;
pub mod replication;
pub mod storage;
pub mod store;
pub mod swarm;
pub mod topology;
pub mod types;

// Re-exports
pub use codec::Value;
pub use config::{PartitionConfig, StoreConfig, DEFAULT_PARTITION};
pub use error::{StoreError, StoreResult};
pub use events::StoreEvent;
pub use framing::{FrameHeader, FrameSink, Merger, PacketId, Splitter};
pub use gossip::GossipExtension;
pub use index::{CoreTxn, IndexReader, IndexView, QueryStream, RangeOptions};
pub use log::{BatchEntry, CausalMerge, Entry, LogHandle, LogOptions, LogStore};
pub use projection::ProjectionEngine;
pub use protocol::{decode_op, encode_op, Protocol, ProtocolSet};
pub use replication::WireMessage;
pub use storage::Storage;
pub use store::{Store, StoreRegistry};
pub use swarm::{IrohSwarm, MemoryHub, MemorySwarm, PeerConnection, Swarm, BRAIDSTORE_ALPN};
pub use topology::{AddOptions, RemoveOptions, TopologyKeys, TopologyManager};
pub use types::*;
