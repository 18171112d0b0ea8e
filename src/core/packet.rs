//! Decoded application packets.

use bytes::Bytes;
use serde_json::Value;

use crate::core::client::Client;

/// One decoded frame, as seen by filters and handlers.
///
/// Created once per complete frame and consumed by a single dispatch pass.
#[derive(Debug, Clone)]
pub struct Packet {
    raw: Bytes,
    value: Value,
    sender: Client,
    sequence: u64,
}

impl Packet {
    pub fn new(raw: Bytes, value: Value, sender: Client, sequence: u64) -> Self {
        Self {
            raw,
            value,
            sender,
            sequence,
        }
    }

    /// Payload bytes exactly as they arrived
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn sender(&self) -> &Client {
        &self.sender
    }

    /// Per-connection arrival number, strictly increasing
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Look up a top-level field when the payload is a mapping
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.as_object().and_then(|fields| fields.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}
