//! # TLS Transport
//!
//! Server-side TLS over accepted TCP sockets using `tokio-rustls`.
//!
//! Certificate and key loading are left to the caller: the acceptor takes a
//! ready `rustls::ServerConfig`. The ban check runs on the raw socket before
//! this acceptor is reached, so banned peers never get a handshake.
//!
//! ## Usage
//! ```ignore
//! let tls = rustls::ServerConfig::builder()
//!     .with_safe_defaults()
//!     .with_no_client_auth()
//!     .with_single_cert(certs, key)?;
//! let server = Server::new(config)?.with_acceptor(TlsStreamAcceptor::new(Arc::new(tls)));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::transport::{BoxedStream, StreamAcceptor};
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT};

/// Wraps accepted sockets in TLS
#[derive(Clone)]
pub struct TlsStreamAcceptor {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsStreamAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Bound how long a peer may take to finish the handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl StreamAcceptor for TlsStreamAcceptor {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> BoxFuture<'static, Result<BoxedStream>> {
        let acceptor = self.acceptor.clone();
        let timeout = self.handshake_timeout;
        async move {
            stream.set_nodelay(true)?;
            let handshake = async {
                acceptor.accept(stream).await.map_err(|e| {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    ProtocolError::TlsError(e.to_string())
                })
            };
            let tls_stream = with_timeout_error(handshake, timeout).await?;
            debug!(%peer, "TLS handshake complete");
            Ok(Box::new(tls_stream) as BoxedStream)
        }
        .boxed()
    }
}

impl std::fmt::Debug for TlsStreamAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStreamAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}
