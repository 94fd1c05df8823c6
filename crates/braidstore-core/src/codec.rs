//! Tagged value encoding
//!
//! Every value crossing the log/index boundary starts with a one-byte
//! discriminator so decoding never guesses at the payload type.
//!
//! ```text
//! +-----+-------------------------------+
//! | tag | payload                       |
//! +-----+-------------------------------+
//!   0     raw bytes
//!   1     utf-8 text
//!   2     JSON document
//!   3     f64, big-endian (8 bytes)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

const TAG_BINARY: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_JSON: u8 = 2;
const TAG_NUMBER: u8 = 3;

/// A value stored in the index or carried in a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Opaque bytes
    Binary(Vec<u8>),
    /// UTF-8 text
    Text(String),
    /// Structured JSON
    Json(serde_json::Value),
    /// Numeric value
    Number(f64),
}

impl Value {
    /// Encode with the type discriminator prepended
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Value::Binary(bytes) => {
                out.push(TAG_BINARY);
                out.extend_from_slice(bytes);
            }
            Value::Text(text) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(text.as_bytes());
            }
            Value::Json(json) => {
                out.push(TAG_JSON);
                serde_json::to_writer(&mut out, json)?;
            }
            Value::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_be_bytes());
            }
        }
        Ok(out)
    }

    /// Decode a tagged buffer
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (tag, payload) = bytes
            .split_first()
            .ok_or_else(|| StoreError::Serialization("Empty value buffer".to_string()))?;

        match *tag {
            TAG_BINARY => Ok(Value::Binary(payload.to_vec())),
            TAG_TEXT => String::from_utf8(payload.to_vec())
                .map(Value::Text)
                .map_err(|e| StoreError::Serialization(format!("Invalid utf-8 value: {}", e))),
            TAG_JSON => Ok(Value::Json(serde_json::from_slice(payload)?)),
            TAG_NUMBER => {
                let arr: [u8; 8] = payload.try_into().map_err(|_| {
                    StoreError::Serialization(format!(
                        "Numeric value must be 8 bytes (got {})",
                        payload.len()
                    ))
                })?;
                Ok(Value::Number(f64::from_be_bytes(arr)))
            }
            other => Err(StoreError::Serialization(format!(
                "Unknown value tag: {}",
                other
            ))),
        }
    }

    /// Borrow the text, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the JSON document, if this is a structured value
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Binary(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            Value::Text(s) => f.write_str(s),
            Value::Json(v) => write!(f, "{}", v),
            Value::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}
