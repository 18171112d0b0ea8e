//! # Payload Encodings
//!
//! Conversion between frame payload bytes and structured values.
//!
//! The encoding is chosen once per server instance from a closed set:
//! - **JSON**: textual, human-readable, the default
//! - **MessagePack**: compact binary keyed encoding
//!
//! Decoding yields a `serde_json::Value`, so handlers and filters see the same
//! shape regardless of the wire encoding. A decode failure is a payload fault:
//! the frame boundary was intact, so the connection stays usable.
//!
//! ## Usage
//! ```rust
//! use asyncaproto::core::serialization::{PayloadCodec, PayloadEncoding};
//! use serde_json::json;
//!
//! let codec = PayloadCodec::new(PayloadEncoding::MessagePack);
//! let bytes = codec.encode(&json!({"cmd": "ping"})).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), json!({"cmd": "ping"}));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Supported payload encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Human-readable JSON (default)
    #[default]
    Json,
    /// Compact binary MessagePack
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl PayloadEncoding {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            PayloadEncoding::Json => "JSON",
            PayloadEncoding::MessagePack => "MessagePack",
        }
    }
}

/// Encoder/decoder for one payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadCodec {
    encoding: PayloadEncoding,
}

impl PayloadCodec {
    pub fn new(encoding: PayloadEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }

    /// Decode payload bytes into a structured value
    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        match self.encoding {
            PayloadEncoding::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            PayloadEncoding::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }

    /// Encode a structured value into payload bytes
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self.encoding {
            PayloadEncoding::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            PayloadEncoding::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }
}
