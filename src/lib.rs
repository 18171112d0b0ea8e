//! # asyncaproto
//!
//! Asynchronous TCP application server core built around a length-prefixed
//! binary wire protocol.
//!
//! The server reassembles byte streams into frames, decodes each payload
//! (JSON or MessagePack), and routes the resulting packet through handlers
//! ordered by priority and filter specificity. Bans, sessions and API keys
//! decide which peers are served and which handlers they may reach.
//!
//! ## Layers
//! - [`core`]: framing codec, payload codecs, packets and client handles
//! - [`protocol`]: filters, handlers, groups, dispatch and the fault taxonomy
//! - [`registry`]: bans, sessions and API keys
//! - [`service`]: the accept loop and per-connection actors
//! - [`transport`]: plain TCP and TLS stream providers
//! - [`config`], [`error`], [`utils`]: ambient plumbing
//!
//! ## Example
//! ```no_run
//! use asyncaproto::{Filter, Handler, NetworkConfig, Outcome, Server};
//!
//! # async fn serve() -> asyncaproto::Result<()> {
//! let server = Server::new(NetworkConfig::default())?;
//! server.dispatcher().register(
//!     Handler::new("ping", |_packet, _client| Ok(Outcome::reply_and_stop(serde_json::json!({"pong": true}))))
//!         .filter(Filter::field("request_type", "ping")),
//! )?;
//! server.run().await
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::client::{Client, ClientId};
pub use crate::core::packet::Packet;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::{DispatchMode, DispatchReport, Dispatcher};
pub use crate::protocol::fault::{Fault, FaultKind};
pub use crate::protocol::filter::{FieldRule, Filter};
pub use crate::protocol::handler::{Group, Handler, Outcome, Propagation};
pub use crate::registry::ban::BanDuration;
pub use crate::service::{Server, ServerHandle};
