//! # Server
//!
//! Owns the listener, the shared registries and the set of connection actors.
//!
//! ## Accept Path
//! 1. Accept a TCP socket
//! 2. Banned peer: close immediately, no actor, no bytes read
//! 3. Over `max_connections`: best-effort `ERR_SERVER_FULL` reply, close
//! 4. Wrap through the configured [`StreamAcceptor`] (plain or TLS)
//! 5. Spawn a [`ConnectionActor`]
//!
//! ## Shutdown
//! [`ServerHandle::shutdown`] cancels the accept loop (dropping the listener)
//! and every actor's token. Actors stop after the packet they are processing;
//! those still running after the grace period are aborted. The session,
//! API key and ban registries are then emptied. Shutdown is idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::client::{Client, ClientId};
use crate::core::codec::FrameCodec;
use crate::core::serialization::PayloadCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::fault::Fault;
use crate::registry::api_key::ApiKeyStore;
use crate::registry::ban::BanRegistry;
use crate::registry::session::SessionRegistry;
use crate::service::connection::{ConnectionActor, ConnectionContext};
use crate::transport::{PlainAcceptor, StreamAcceptor};
use crate::utils::metrics::{Metrics, MetricsSnapshot};

const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Application server, configured but not yet listening
pub struct Server {
    config: NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    bans: Arc<BanRegistry>,
    sessions: Arc<SessionRegistry>,
    api_keys: Arc<ApiKeyStore>,
    metrics: Arc<Metrics>,
    acceptor: Arc<dyn StreamAcceptor>,
}

impl Server {
    /// Build a server from a validated configuration.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate_strict()?;

        let bans = Arc::new(BanRegistry::new());
        let sessions = Arc::new(SessionRegistry::new(config.server.session_limit, bans.clone()));
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::with_mode(config.server.dispatch_mode)),
            bans,
            sessions,
            api_keys: Arc::new(ApiKeyStore::new()),
            metrics: Arc::new(Metrics::new()),
            acceptor: Arc::new(PlainAcceptor),
            config,
        })
    }

    /// Use a different stream provider, e.g. TLS
    pub fn with_acceptor(mut self, acceptor: impl StreamAcceptor) -> Self {
        self.acceptor = Arc::new(acceptor);
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Register handlers and the fault hook here before `start`
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bans(&self) -> &Arc<BanRegistry> {
        &self.bans
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyStore> {
        &self.api_keys
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Bind the listener and start accepting in a background task.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.server.address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            transport = self.acceptor.name(),
            encoding = self.config.protocol.encoding.name(),
            "Server listening"
        );

        let token = CancellationToken::new();
        let accept_loop = AcceptLoop {
            listener,
            ctx: Arc::new(ConnectionContext {
                dispatcher: self.dispatcher.clone(),
                sessions: self.sessions.clone(),
                metrics: self.metrics.clone(),
                payload: PayloadCodec::new(self.config.protocol.encoding),
                frame: self.config.protocol.frame_config(),
                idle_timeout: self.config.server.idle_timeout,
                read_buffer_size: self.config.protocol.read_buffer_size,
            }),
            bans: self.bans.clone(),
            api_keys: self.api_keys.clone(),
            acceptor: self.acceptor.clone(),
            slots: Arc::new(Semaphore::new(self.config.server.max_connections)),
            max_connections: self.config.server.max_connections,
            outbound_capacity: self.config.server.outbound_queue_size,
            grace: self.config.server.shutdown_timeout,
            token: token.clone(),
            next_id: AtomicU64::new(1),
        };
        let task = tokio::spawn(accept_loop.run());

        Ok(ServerHandle {
            inner: Arc::new(HandleInner {
                local_addr,
                token,
                task: Mutex::new(Some(task)),
                dispatcher: self.dispatcher,
                bans: self.bans,
                sessions: self.sessions,
                api_keys: self.api_keys,
                metrics: self.metrics,
            }),
        })
    }

    /// Serve until Ctrl-C, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
            }
            _ = handle.inner.token.cancelled() => {}
        }
        handle.shutdown().await;
        handle.metrics_log();
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.server.address)
            .field("transport", &self.acceptor.name())
            .finish()
    }
}

struct AcceptLoop {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    bans: Arc<BanRegistry>,
    api_keys: Arc<ApiKeyStore>,
    acceptor: Arc<dyn StreamAcceptor>,
    slots: Arc<Semaphore>,
    max_connections: usize,
    outbound_capacity: usize,
    grace: Duration,
    token: CancellationToken,
    next_id: AtomicU64,
}

impl AcceptLoop {
    async fn run(self) {
        let mut actors = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,

                // Reap finished actors so the set doesn't grow unbounded.
                Some(joined) = actors.join_next(), if !actors.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked");
                        }
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, &mut actors),
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        // Back off on resource exhaustion (e.g. EMFILE).
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        let AcceptLoop {
            listener,
            grace,
            ctx,
            bans,
            api_keys,
            ..
        } = self;
        drop(listener);
        info!(connections = actors.len(), "Listener closed, waiting for connections");

        let drained = tokio::time::timeout(grace, async {
            while actors.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = actors.len(), "Shutdown grace period elapsed, aborting connections");
            actors.shutdown().await;
        }

        // Registries live as long as the server.
        let sessions = ctx.sessions.clear();
        let keys = api_keys.clear();
        bans.clear();
        info!(sessions, keys, "Server stopped");
    }

    #[instrument(skip_all, fields(peer = %peer))]
    fn admit(&self, stream: TcpStream, peer: SocketAddr, actors: &mut JoinSet<()>) {
        if let Err(e) = self.bans.check(peer.ip()) {
            self.ctx.metrics.connection_banned();
            info!(reason = %e, "Rejected banned peer");
            drop(stream);
            return;
        }

        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (client, outbound) = Client::with_capacity(id, peer, self.outbound_capacity);

        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            self.ctx.metrics.connection_over_capacity();
            warn!(max = self.max_connections, "Server full, rejecting connection");
            let fault = Fault::from_error(&ProtocolError::ServerFull(self.max_connections));
            let reply = fault.and_then(|f| self.ctx.dispatcher.fault_reply(&f, &client));
            let ctx = self.ctx.clone();
            actors.spawn(async move {
                reject(stream, reply, &ctx).await;
            });
            return;
        };

        let ctx = self.ctx.clone();
        let acceptor = self.acceptor.clone();
        let token = self.token.child_token();
        actors.spawn(async move {
            let _permit = permit;
            let stream = match acceptor.accept(stream, peer).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, error = %e, "Transport setup failed");
                    return;
                }
            };
            ctx.metrics.connection_established();
            debug!(%peer, client_id = %client.id(), "Connection accepted");
            ConnectionActor::new(stream, client, outbound, ctx, token)
                .run()
                .await;
        });
    }
}

/// Write a single failure reply on a raw socket, then close it.
async fn reject(stream: TcpStream, reply: Option<serde_json::Value>, ctx: &ConnectionContext) {
    let Some(reply) = reply else {
        return;
    };
    let Ok(bytes) = ctx.payload.encode(&reply) else {
        return;
    };
    let mut framed = Framed::new(stream, FrameCodec::new(ctx.frame));
    let write = async {
        framed.send(Bytes::from(bytes)).await?;
        framed.close().await
    };
    if tokio::time::timeout(REJECT_WRITE_TIMEOUT, write).await.is_err() {
        debug!("Timed out writing rejection");
    }
}

struct HandleInner {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Arc<Dispatcher>,
    bans: Arc<BanRegistry>,
    sessions: Arc<SessionRegistry>,
    api_keys: Arc<ApiKeyStore>,
    metrics: Arc<Metrics>,
}

/// Handle to a running server
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    /// Address the listener is bound to (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn bans(&self) -> &Arc<BanRegistry> {
        &self.inner.bans
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyStore> {
        &self.inner.api_keys
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn metrics_log(&self) {
        self.inner.metrics.log_metrics();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Stop accepting, signal every connection and wait for the accept loop
    /// to finish draining (bounded by the configured grace period).
    ///
    /// Safe to call more than once and from several tasks.
    pub async fn shutdown(&self) {
        if !self.inner.token.is_cancelled() {
            info!(address = %self.inner.local_addr, "Shutting down server");
        }
        self.inner.token.cancel();
        self.wait().await;
    }

    /// Wait for the server to stop without requesting it.
    pub async fn wait(&self) {
        let mut task = self.inner.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.inner.local_addr)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
