//! Protocol plugins
//!
//! A protocol is the deterministic function that turns decoded operations
//! into index writes. Each plugin owns a closed `serde` enum of operations and
//! pattern-matches on it in [`Protocol::apply`]:
//!
//! ```
//! use braidstore_core::{CoreTxn, IndexReader, Protocol, StoreResult};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterOp {
//!     Incr { key: String },
//! }
//!
//! struct Counter;
//!
//! impl Protocol for Counter {
//!     type Op = CounterOp;
//!
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     fn apply(&self, op: CounterOp, core: &CoreTxn<'_>, index: &IndexReader<'_>) -> StoreResult<()> {
//!         match op {
//!             CounterOp::Incr { key } => {
//!                 let current = match index.get(&key)? {
//!                     Some(braidstore_core::Value::Number(n)) => n,
//!                     _ => 0.0,
//!                 };
//!                 core.put(&key, current + 1.0)
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! On the wire an operation is the tagged JSON form of the enum, carried as a
//! [`Value::Json`] payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Value;
use crate::error::{StoreError, StoreResult};
use crate::index::{CoreTxn, IndexReader};

/// Deterministic projection of operations into an index
pub trait Protocol: Send + Sync + 'static {
    /// Closed set of operations this protocol understands
    type Op: Serialize + DeserializeOwned + Send;

    /// Name partitions use to select this protocol
    fn name(&self) -> &str;

    /// Apply one operation. Any error aborts the whole batch.
    fn apply(&self, op: Self::Op, core: &CoreTxn<'_>, index: &IndexReader<'_>) -> StoreResult<()>;
}

/// Encode an operation as a log payload
pub fn encode_op<O: Serialize>(op: &O) -> StoreResult<Vec<u8>> {
    Value::Json(serde_json::to_value(op)?).encode()
}

/// Decode a log payload into a protocol's operation
pub fn decode_op<O: DeserializeOwned>(payload: &[u8]) -> StoreResult<O> {
    let value = Value::decode(payload)
        .map_err(|e| StoreError::InvalidOperation(format!("Undecodable payload: {}", e)))?;
    match value {
        Value::Json(json) => serde_json::from_value(json)
            .map_err(|e| StoreError::InvalidOperation(e.to_string())),
        other => Err(StoreError::InvalidOperation(format!(
            "Operation must be structured, got {:?}",
            other
        ))),
    }
}

/// Object-safe form of [`Protocol`] used by the projection engine
pub(crate) trait DynProtocol: Send + Sync {
    fn name(&self) -> &str;
    fn apply_payload(
        &self,
        payload: &[u8],
        core: &CoreTxn<'_>,
        index: &IndexReader<'_>,
    ) -> StoreResult<()>;
}

impl<P: Protocol> DynProtocol for P {
    fn name(&self) -> &str {
        Protocol::name(self)
    }

    fn apply_payload(
        &self,
        payload: &[u8],
        core: &CoreTxn<'_>,
        index: &IndexReader<'_>,
    ) -> StoreResult<()> {
        let op = decode_op::<P::Op>(payload)?;
        self.apply(op, core, index)
    }
}

/// Protocols available to a store, keyed by name
#[derive(Clone, Default)]
pub struct ProtocolSet {
    protocols: BTreeMap<String, Arc<dyn DynProtocol>>,
}

impl ProtocolSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol under its own name, replacing any previous one
    pub fn with<P: Protocol>(mut self, protocol: P) -> Self {
        self.insert(protocol);
        self
    }

    /// Register a protocol under its own name, replacing any previous one
    pub fn insert<P: Protocol>(&mut self, protocol: P) {
        let name = Protocol::name(&protocol).to_string();
        self.protocols.insert(name, Arc::new(protocol));
    }

    /// Whether a protocol is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    /// Registered protocol names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    pub(crate) fn get(&self, name: &str) -> StoreResult<Arc<dyn DynProtocol>> {
        self.protocols
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownProtocol(name.to_string()))
    }
}

impl std::fmt::Debug for ProtocolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.protocols.keys()).finish()
    }
}
