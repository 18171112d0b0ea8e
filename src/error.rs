//! # Error Types
//!
//! Error handling for the framing, dispatch and registry layers.
//!
//! Every fault class the server distinguishes maps to its own variant so that
//! callers can tell a connection-fatal framing fault apart from a recoverable
//! payload fault or a capacity rejection without string matching.
//!
//! ## Error Categories
//! - **Framing**: length headers over the payload ceiling (connection-fatal)
//! - **Payload**: bytes that do not decode with the configured encoding
//! - **Handler**: a callback returned an error or panicked
//! - **Capacity**: session or server member limits reached
//! - **Trust**: bans and API key failures
//! - **I/O / TLS / Config**: everything below and around the protocol
//!
//! ## Example Usage
//! ```rust
//! use asyncaproto::error::{ProtocolError, Result};
//!
//! fn check_len(len: usize, max: usize) -> Result<()> {
//!     if len > max {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_len(10, 4).is_err());
//! ```

use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Error message constants shared by lock and registry error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Registry lock errors
    pub const ERR_SESSION_LOCK: &str = "Session registry lock poisoned";
    pub const ERR_API_KEY_LOCK: &str = "API key store lock poisoned";
}

/// ProtocolError is the primary error type for all server operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handler '{handler}' failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("Handler '{0}' panicked")]
    HandlerPanicked(String),

    #[error("Session '{session}' is full ({limit} members)")]
    SessionFull { session: String, limit: usize },

    #[error("Server is full ({0} connections)")]
    ServerFull(usize),

    #[error("Address {0} is banned")]
    Banned(IpAddr),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown client: {0}")]
    UnknownClient(u64),

    #[error("API key not found")]
    ApiKeyNotFound,

    #[error("API key has been revoked")]
    ApiKeyRevoked,

    #[error("API key has expired")]
    ApiKeyExpired,

    #[error("Invalid address pattern: {0}")]
    InvalidAddress(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for faults after which the byte stream can no longer be trusted.
    pub fn is_framing_fault(&self) -> bool {
        matches!(self, ProtocolError::OversizedPacket(_))
    }

    /// True for capacity rejections (session or server limits).
    pub fn is_capacity_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::SessionFull { .. } | ProtocolError::ServerFull(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
