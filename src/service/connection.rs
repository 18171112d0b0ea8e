//! # Connection Actor
//!
//! One task per accepted connection. The actor exclusively owns the stream
//! and its read buffer, and runs a single sequential loop:
//!
//! ```text
//! read -> FrameCodec -> PayloadCodec -> Packet(seq) -> Dispatcher -> outbound queue -> write
//! ```
//!
//! Everything addressed to the client from elsewhere (replies, broadcasts,
//! close requests) arrives on the client's outbound queue and is written by
//! this task, so the stream is never shared.
//!
//! ## Fault Policy
//! - Framing fault: report, flush, close. The stream offset can't be trusted.
//! - Payload fault: report, keep reading.
//! - Idle timeout (no bytes read for the configured window): report, flush, close.
//! - Outbound queue overflow: close without flushing.
//! - Peer close or I/O error: tear down quietly.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::client::{Client, Outbound};
use crate::core::codec::{FrameCodec, FrameConfig};
use crate::core::packet::Packet;
use crate::core::serialization::PayloadCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::fault::{Fault, FaultKind};
use crate::registry::session::SessionRegistry;
use crate::transport::BoxedStream;
use crate::utils::metrics::Metrics;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// State every connection actor shares with the server
#[derive(Debug)]
pub struct ConnectionContext {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
    pub payload: PayloadCodec,
    pub frame: FrameConfig,
    pub idle_timeout: Duration,
    pub read_buffer_size: usize,
}

/// Why a connection ended
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    Requested,
    Shutdown,
    IdleTimeout,
    Overflow,
    Framing(ProtocolError),
    Io(ProtocolError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Requested => f.write_str("close requested"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Overflow => f.write_str("outbound queue overflow"),
            CloseReason::Framing(e) => write!(f, "framing fault: {e}"),
            CloseReason::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

/// Stream wrapper that records when bytes last arrived
struct ReadActivity<S> {
    inner: S,
    last_read: Instant,
}

impl<S> ReadActivity<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            last_read: Instant::now(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReadActivity<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.last_read = Instant::now();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReadActivity<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Per-connection control loop
pub struct ConnectionActor {
    client: Client,
    framed: Framed<ReadActivity<BoxedStream>, FrameCodec>,
    outbound: Receiver<Outbound>,
    overflow: CancellationToken,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
    next_sequence: u64,
}

impl ConnectionActor {
    pub fn new(
        stream: BoxedStream,
        client: Client,
        outbound: Receiver<Outbound>,
        ctx: Arc<ConnectionContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let codec = FrameCodec::new(ctx.frame);
        let framed = Framed::with_capacity(ReadActivity::new(stream), codec, ctx.read_buffer_size);
        Self {
            overflow: client.overflow_token(),
            client,
            framed,
            outbound,
            ctx,
            shutdown,
            next_sequence: 1,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Serve until the peer leaves, a fatal fault occurs or shutdown is signalled.
    #[instrument(skip(self), fields(client_id = %self.client.id(), peer = %self.client.address()))]
    pub async fn run(mut self) -> CloseReason {
        debug!("Connection actor started");
        let reason = self.serve().await;
        self.teardown(&reason).await;
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        let idle = self.ctx.idle_timeout;
        let deadline = sleep(idle);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return CloseReason::Shutdown,

                _ = self.overflow.cancelled() => {
                    warn!("Client stopped draining its queue, closing connection");
                    return CloseReason::Overflow;
                }

                msg = self.outbound.recv() => match msg {
                    Some(Outbound::Packet(value)) => {
                        let written = match self.write_value(value).await {
                            Ok(()) => self.framed.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            return CloseReason::Io(e);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = self.flush_outbound().await;
                        return CloseReason::Requested;
                    }
                },

                frame = self.framed.next() => match frame {
                    Some(Ok(payload)) => {
                        self.process(payload).await;
                        match self.flush_outbound().await {
                            Ok(false) => {}
                            Ok(true) => return CloseReason::Requested,
                            Err(e) => return CloseReason::Io(e),
                        }
                    }
                    Some(Err(e)) if e.is_framing_fault() => {
                        warn!(error = %e, "Framing fault, closing connection");
                        self.raise(Fault::new(FaultKind::Framing, e.to_string()));
                        let _ = self.flush_outbound().await;
                        return CloseReason::Framing(e);
                    }
                    Some(Err(e)) => return CloseReason::Io(e),
                    None => return CloseReason::PeerClosed,
                },

                _ = &mut deadline => {
                    // Partial frames count as activity.
                    let resume = self.framed.get_ref().last_read + idle;
                    if resume > Instant::now() {
                        deadline.as_mut().reset(resume);
                        continue;
                    }
                    debug!(?idle, "No data received, closing connection");
                    if let Some(fault) = Fault::from_error(&ProtocolError::ConnectionTimeout) {
                        self.raise(fault);
                    }
                    let _ = self.flush_outbound().await;
                    return CloseReason::IdleTimeout;
                }
            }
        }
    }

    /// Decode and dispatch one frame payload.
    async fn process(&mut self, payload: Bytes) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.ctx.metrics.frame_received(payload.len());

        let value = match self.ctx.payload.decode(&payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(sequence, error = %e, "Payload fault");
                self.raise(Fault::new(FaultKind::Payload, e.to_string()).with_sequence(sequence));
                return;
            }
        };

        trace!(sequence, bytes = payload.len(), "Dispatching packet");
        let packet = Arc::new(Packet::new(payload, value, self.client.clone(), sequence));
        match self.ctx.dispatcher.dispatch(packet).await {
            Ok(report) => {
                self.ctx.metrics.packet_dispatched(report.invoked.len());
                if let Some(fault) = &report.fault {
                    self.ctx.metrics.fault(fault.kind);
                }
            }
            Err(e) => error!(sequence, error = %e, "Dispatch failed"),
        }
    }

    fn raise(&self, fault: Fault) {
        self.ctx.metrics.fault(fault.kind);
        self.ctx.dispatcher.report_fault(&fault, &self.client);
    }

    /// Encode one value into the write buffer. Values that can't be encoded
    /// or framed are dropped with a warning; only I/O errors are returned.
    async fn write_value(&mut self, value: serde_json::Value) -> Result<()> {
        let bytes = match self.ctx.payload.encode(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Dropping reply that failed to encode");
                return Ok(());
            }
        };
        let frame = self.ctx.frame;
        if bytes.len() > frame.max_payload_size || bytes.len() > frame.header_width.max_len() {
            warn!(bytes = bytes.len(), "Dropping reply larger than the frame limit");
            return Ok(());
        }

        let len = bytes.len();
        self.framed.feed(Bytes::from(bytes)).await?;
        self.ctx.metrics.frame_sent(len);
        Ok(())
    }

    /// Write everything queued so far, including values queued after a
    /// close request. Returns `true` if a close was requested.
    async fn flush_outbound(&mut self) -> Result<bool> {
        let mut close = false;
        while let Ok(msg) = self.outbound.try_recv() {
            match msg {
                Outbound::Packet(value) => self.write_value(value).await?,
                Outbound::Close => close = true,
            }
        }
        self.framed.flush().await?;
        Ok(close)
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        self.outbound.close();
        let left = self.ctx.sessions.remove_client(self.client.id());
        if !left.is_empty() {
            debug!(sessions = left.len(), "Left sessions on disconnect");
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, self.framed.close())
            .await
            .is_err()
        {
            debug!("Timed out closing stream");
        }

        self.ctx.metrics.connection_closed();
        match reason {
            CloseReason::Io(e) => info!(error = %e, "Connection closed after I/O error"),
            other => info!(reason = %other, "Connection closed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::client::ClientId;
    use crate::core::serialization::PayloadEncoding;
    use crate::protocol::handler::{Handler, Outcome};
    use crate::registry::ban::BanRegistry;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    fn context(dispatcher: Dispatcher, idle: Duration) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext {
            dispatcher: Arc::new(dispatcher),
            sessions: Arc::new(SessionRegistry::new(0, Arc::new(BanRegistry::new()))),
            metrics: Arc::new(Metrics::new()),
            payload: PayloadCodec::new(PayloadEncoding::Json),
            frame: FrameConfig {
                max_payload_size: 1024,
                ..FrameConfig::default()
            },
            idle_timeout: idle,
            read_buffer_size: 64,
        })
    }

    fn spawn(
        ctx: Arc<ConnectionContext>,
        token: CancellationToken,
    ) -> (
        Framed<DuplexStream, FrameCodec>,
        tokio::task::JoinHandle<CloseReason>,
    ) {
        let (server_side, client_side) = duplex(4096);
        let (client, rx) = Client::new(ClientId(1), "127.0.0.1:5555".parse().unwrap());
        let actor = ConnectionActor::new(Box::new(server_side), client, rx, ctx.clone(), token);
        ctx.metrics.connection_established();
        let peer = Framed::new(client_side, FrameCodec::new(ctx.frame));
        (peer, tokio::spawn(actor.run()))
    }

    fn echo() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(Handler::new("echo", |p, _| {
                Ok(Outcome::reply(json!({"seq": p.sequence(), "body": p.value().clone()})))
            }))
            .unwrap();
        dispatcher
    }

    async fn next_json(peer: &mut Framed<DuplexStream, FrameCodec>) -> serde_json::Value {
        let frame = peer.next().await.expect("frame").expect("valid frame");
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_sequences_increase_and_payload_fault_keeps_connection() {
        let ctx = context(echo(), Duration::from_secs(5));
        let (mut peer, task) = spawn(ctx.clone(), CancellationToken::new());

        peer.send(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        assert_eq!(next_json(&mut peer).await, json!({"seq": 1, "body": {"a": 1}}));

        peer.send(Bytes::from_static(b"not json")).await.unwrap();
        assert_eq!(
            next_json(&mut peer).await,
            json!({"status": "failure", "error": "ERR_REQUEST_MALFORMED"})
        );

        peer.send(Bytes::from_static(b"{\"a\":2}")).await.unwrap();
        assert_eq!(next_json(&mut peer).await, json!({"seq": 3, "body": {"a": 2}}));

        drop(peer);
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
        assert_eq!(ctx.metrics.snapshot().payload_faults, 1);
        assert_eq!(ctx.metrics.snapshot().connections_active, 0);
    }

    #[tokio::test]
    async fn test_oversized_header_closes_connection() {
        let ctx = context(echo(), Duration::from_secs(5));
        let (peer, task) = spawn(ctx.clone(), CancellationToken::new());

        let mut stream = peer.into_inner();
        tokio::io::AsyncWriteExt::write_all(&mut stream, &[0, 0, 0x10, 0])
            .await
            .unwrap();

        assert!(matches!(task.await.unwrap(), CloseReason::Framing(_)));
        assert_eq!(ctx.metrics.snapshot().framing_faults, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let ctx = context(echo(), Duration::from_millis(50));
        let (mut peer, task) = spawn(ctx, CancellationToken::new());

        assert_eq!(
            next_json(&mut peer).await,
            json!({"status": "failure", "error": "ERR_TIMED_OUT"})
        );
        assert!(matches!(task.await.unwrap(), CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_trickling_sender_is_not_idle() {
        let ctx = context(echo(), Duration::from_millis(200));
        let (mut peer, task) = spawn(ctx, CancellationToken::new());

        let body = br#"{"slow":true}"#;
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);
        let started = std::time::Instant::now();
        for byte in wire {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tokio::io::AsyncWriteExt::write_all(peer.get_mut(), &[byte])
                .await
                .expect("connection closed mid-frame");
        }
        assert!(started.elapsed() > Duration::from_millis(200));

        assert_eq!(next_json(&mut peer).await, json!({"seq": 1, "body": {"slow": true}}));
        assert!(!task.is_finished());

        // Silence after the frame still times out.
        assert_eq!(
            next_json(&mut peer).await,
            json!({"status": "failure", "error": "ERR_TIMED_OUT"})
        );
        assert!(matches!(task.await.unwrap(), CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_queue_overflow_closes_connection() {
        let ctx = context(echo(), Duration::from_secs(5));
        let (server_side, _client_side) = duplex(4096);
        let (client, rx) = Client::with_capacity(ClientId(9), "127.0.0.1:5556".parse().unwrap(), 1);
        client.send(json!(1)).unwrap();
        assert!(client.send(json!(2)).is_err());

        ctx.metrics.connection_established();
        let actor = ConnectionActor::new(
            Box::new(server_side),
            client.clone(),
            rx,
            ctx.clone(),
            CancellationToken::new(),
        );
        assert!(matches!(actor.run().await, CloseReason::Overflow));
        assert!(client.is_closed());
        assert_eq!(ctx.metrics.snapshot().connections_active, 0);
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_actor() {
        let token = CancellationToken::new();
        let ctx = context(echo(), Duration::from_secs(5));
        let (_peer, task) = spawn(ctx, token.clone());

        token.cancel();
        assert!(matches!(task.await.unwrap(), CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn test_handler_can_close_connection() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(Handler::new("bye", |_, client| {
                client.send(json!("bye"))?;
                client.close();
                Ok(Outcome::stop())
            }))
            .unwrap();
        let (mut peer, task) = spawn(context(dispatcher, Duration::from_secs(5)), CancellationToken::new());

        peer.send(Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(next_json(&mut peer).await, json!("bye"));
        assert!(matches!(task.await.unwrap(), CloseReason::Requested));
    }
}
