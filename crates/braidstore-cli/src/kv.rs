//! Key-value protocol used by the CLI

use braidstore_core::{CoreTxn, IndexReader, Protocol, StoreResult, Value};
use serde::{Deserialize, Serialize};

/// Name partitions use to select [`KvProtocol`]
pub const KV_PROTOCOL: &str = "kv";

/// Operations understood by [`KvProtocol`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum KvOp {
    /// Store text under a key
    Set { key: String, value: String },
    /// Store a JSON document under a key
    SetJson {
        key: String,
        value: serde_json::Value,
    },
    /// Remove a key
    Del { key: String },
}

/// Last operation in replay order wins
pub struct KvProtocol;

impl Protocol for KvProtocol {
    type Op = KvOp;

    fn name(&self) -> &str {
        KV_PROTOCOL
    }

    fn apply(&self, op: KvOp, core: &CoreTxn<'_>, _index: &IndexReader<'_>) -> StoreResult<()> {
        match op {
            KvOp::Set { key, value } => core.put(&key, value),
            KvOp::SetJson { key, value } => core.put(&key, Value::Json(value)),
            KvOp::Del { key } => core.del(&key),
        }
    }
}

/// Render a stored value for the terminal
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Text(text) => text.clone(),
        Value::Json(json) => json.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Binary(bytes) => format!("0x{}", hex::encode(bytes)),
    }
}
