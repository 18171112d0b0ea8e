//! Client handles.
//!
//! A [`Client`] is a cheap, cloneable reference to one connection. It never
//! owns the socket: the connection actor does. Writes go through the actor's
//! outbound queue, so any task (a handler on another connection, a session
//! broadcast) can address a client without touching its stream.
//!
//! The queue is bounded. A client whose queue overflows is treated as gone:
//! the send fails with `ConnectionClosed` and the actor closes the connection.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ProtocolError, Result};

/// Outbound queue capacity used by [`Client::new`]
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Server-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instructions queued for a connection actor
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encode and write this value as one frame
    Packet(Value),
    /// Flush what is queued, then close the connection
    Close,
}

struct ClientInner {
    id: ClientId,
    address: SocketAddr,
    connected_at: SystemTime,
    outbound: mpsc::Sender<Outbound>,
    overflow: CancellationToken,
}

/// Non-owning handle to a connected client
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(id: ClientId, address: SocketAddr) -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(id, address, DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Like [`new`](Self::new) with an explicit queue capacity (minimum 1).
    pub fn with_capacity(
        id: ClientId,
        address: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            inner: Arc::new(ClientInner {
                id,
                address,
                connected_at: SystemTime::now(),
                outbound: tx,
                overflow: CancellationToken::new(),
            }),
        };
        (client, rx)
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Peer IP, canonicalized (IPv4-mapped IPv6 becomes IPv4)
    pub fn ip(&self) -> IpAddr {
        self.inner.address.ip().to_canonical()
    }

    pub fn connected_at(&self) -> SystemTime {
        self.inner.connected_at
    }

    /// Queue a value to be written to this client.
    ///
    /// Fails with `ConnectionClosed` once the owning actor has torn down or
    /// the queue has overflowed.
    pub fn send(&self, value: Value) -> Result<()> {
        if self.inner.overflow.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.push(Outbound::Packet(value))
    }

    /// Ask the owning actor to close the connection after flushing.
    pub fn close(&self) {
        // Already closed is fine.
        let _ = self.push(Outbound::Close);
    }

    fn push(&self, msg: Outbound) -> Result<()> {
        match self.inner.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if !self.inner.overflow.is_cancelled() {
                    warn!(client_id = %self.inner.id, "Outbound queue full, dropping connection");
                    self.inner.overflow.cancel();
                }
                Err(ProtocolError::ConnectionClosed)
            }
            Err(TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outbound.is_closed() || self.inner.overflow.is_cancelled()
    }

    /// Cancelled when the outbound queue overflows
    pub(crate) fn overflow_token(&self) -> CancellationToken {
        self.inner.overflow.clone()
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Client {}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .finish()
    }
}
