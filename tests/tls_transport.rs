//! TLS transport over loopback with a throwaway self-signed certificate

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use asyncaproto::core::codec::FrameCodec;
use asyncaproto::transport::tls::TlsStreamAcceptor;
use asyncaproto::{Handler, NetworkConfig, Outcome, Server, ServerHandle};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

struct TestCert {
    cert: Certificate,
    key: PrivateKey,
}

fn self_signed() -> TestCert {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .expect("Certificate generation error");
    TestCert {
        cert: Certificate(generated.cert.der().to_vec()),
        key: PrivateKey(generated.signing_key.serialize_der()),
    }
}

async fn start_tls(cert: &TestCert, handshake_timeout: Duration) -> ServerHandle {
    let tls = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.clone()], cert.key.clone())
        .unwrap();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.shutdown_timeout = Duration::from_secs(1);
    });

    let server = Server::new(config)
        .unwrap()
        .with_acceptor(TlsStreamAcceptor::new(Arc::new(tls)).with_handshake_timeout(handshake_timeout));
    server
        .dispatcher()
        .register(Handler::new("echo", |packet, _client| {
            Ok(Outcome::reply_and_stop(packet.value().clone()))
        }))
        .unwrap();
    server.start().await.unwrap()
}

fn connector(cert: &TestCert) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(&cert.cert).unwrap();
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_tls_echo() {
    let cert = self_signed();
    let handle = start_tls(&cert, Duration::from_secs(5)).await;

    let tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector(&cert).connect(name, tcp).await.expect("handshake");
    let mut peer = Framed::new(tls, FrameCodec::default());

    let body = serde_json::to_vec(&json!({"secure": true})).unwrap();
    peer.send(Bytes::from(body)).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(3), peer.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(reply, json!({"secure": true}));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_stalled_handshake_is_dropped() {
    let cert = self_signed();
    let handle = start_tls(&cert, Duration::from_millis(100)).await;

    // Connect but never send a ClientHello.
    let mut tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(
        Duration::from_secs(3),
        tokio::io::AsyncReadExt::read(&mut tcp, &mut buf),
    )
    .await
    .expect("server kept a stalled handshake open");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(handle.metrics().connections_total, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_plaintext_peer_fails_handshake() {
    let cert = self_signed();
    let handle = start_tls(&cert, Duration::from_secs(2)).await;

    let tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut peer = Framed::new(tcp, FrameCodec::default());
    peer.send(Bytes::from_static(br#"{"plain":true}"#)).await.unwrap();

    match tokio::time::timeout(Duration::from_secs(3), peer.next()).await.unwrap() {
        None | Some(Err(_)) => {}
        Some(Ok(frame)) => {
            // A TLS alert may be parsed as a frame; it is never a JSON reply.
            assert!(serde_json::from_slice::<Value>(&frame).is_err());
        }
    }

    handle.shutdown().await;
}
