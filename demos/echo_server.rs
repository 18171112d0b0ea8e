//! Example: a small chat-style server
//!
//! Clients send JSON objects framed with a 4-byte big-endian length header.
//!
//! - `{"request_type": "ping"}` gets `{"pong": true}`
//! - `{"request_type": "join", "session": "lobby"}` joins a session
//! - `{"request_type": "say", "session": "lobby", "text": "hi"}` broadcasts
//! - `{"request_type": "whoami", "api_key": "..."}` needs a valid key
//! - anything else is echoed back
//!
//! Run with: `cargo run --example echo_server`
//! Configure with `ASYNCAPROTO_*` environment variables, e.g.
//! `ASYNCAPROTO_ADDRESS=0.0.0.0:9000 ASYNCAPROTO_LOG_LEVEL=debug`.

use asyncaproto::registry::session::SessionId;
use asyncaproto::utils::logging::init_logging;
use asyncaproto::{Filter, Group, Handler, NetworkConfig, Outcome, ProtocolError, Server};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging)?;

    let server = Server::new(config)?;
    let dispatcher = server.dispatcher();

    dispatcher.register(
        Handler::new("ping", |_packet, _client| {
            Ok(Outcome::reply_and_stop(json!({"pong": true})))
        })
        .filter(Filter::field("request_type", "ping")),
    )?;

    let sessions = server.sessions().clone();
    let join_sessions = sessions.clone();
    let say_sessions = sessions.clone();
    dispatcher.register_group(
        Group::new("sessions")
            .filter(Filter::require(["session"]))
            .handler(
                Handler::new("join", move |packet, client| {
                    let id = packet.get_str("session").unwrap_or_default();
                    join_sessions.associate(client, id)?;
                    Ok(Outcome::reply_and_stop(json!({"joined": id})))
                })
                .filter(Filter::field("request_type", "join")),
            )
            .handler(
                Handler::new("say", move |packet, client| {
                    let id = SessionId::from(packet.get_str("session").unwrap_or_default());
                    if !say_sessions.get_sessions(client.id()).contains(&id) {
                        return Err(ProtocolError::UnknownSession(id.to_string()));
                    }
                    let text = packet.get("text").cloned().unwrap_or_default();
                    say_sessions.broadcast(&id, json!({"from": client.id().0, "text": text}))?;
                    Ok(Outcome::stop())
                })
                .filter(Filter::field("request_type", "say")),
            ),
    )?;

    let keys = server.api_keys().clone();
    let demo_key = keys.issue(json!({"user": "demo"}), None)?;
    info!(key = %demo_key, "Issued demo API key");
    let owner_keys = keys.clone();
    dispatcher.register(
        Handler::new("whoami", move |packet, _client| {
            let owner = owner_keys.get(packet.get_str("api_key").unwrap_or_default())?;
            Ok(Outcome::reply_and_stop(json!({"owner": owner})))
        })
        .filter(Filter::field("request_type", "whoami"))
        .filter(Filter::api_key(keys)),
    )?;

    dispatcher.register(
        Handler::new("echo", |packet, _client| {
            Ok(Outcome::reply(packet.value().clone()))
        })
        .priority(-1),
    )?;

    server.run().await?;
    Ok(())
}
