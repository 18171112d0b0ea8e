//! # Transport Layer
//!
//! Byte-stream providers for accepted connections.
//!
//! The server always accepts TCP. A [`StreamAcceptor`] then turns the raw
//! socket into the stream the connection actor reads from: unchanged for
//! [`PlainAcceptor`], wrapped in TLS for [`tls::TlsStreamAcceptor`]. Both
//! yield the same boxed stream type, so nothing above this layer knows which
//! one is in use.

pub mod tls;

use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;

/// Any bidirectional byte stream a connection actor can own
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Turns an accepted TCP socket into the stream used by the connection
pub trait StreamAcceptor: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> BoxFuture<'static, Result<BoxedStream>>;
}

/// Plain TCP, no wrapping
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

impl StreamAcceptor for PlainAcceptor {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn accept(&self, stream: TcpStream, _peer: SocketAddr) -> BoxFuture<'static, Result<BoxedStream>> {
        async move {
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}
