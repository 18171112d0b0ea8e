//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use asyncaproto::config::NetworkConfig;
use asyncaproto::core::codec::{ByteOrder, HeaderWidth};
use asyncaproto::core::serialization::PayloadEncoding;
use asyncaproto::DispatchMode;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_short_idle_timeout() {
    let mut config = NetworkConfig::default();
    config.server.idle_timeout = Duration::from_millis(5);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Idle timeout too short")));
}

#[test]
fn test_long_idle_timeout() {
    let mut config = NetworkConfig::default();
    config.server.idle_timeout = Duration::from_secs(90_000);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Idle timeout too long")));
}

#[test]
fn test_long_shutdown_timeout() {
    let mut config = NetworkConfig::default();
    config.server.shutdown_timeout = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_zero_outbound_queue() {
    let mut config = NetworkConfig::default();
    config.server.outbound_queue_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Outbound queue size must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 150_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_zero_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.protocol.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_payload_limit_must_fit_header_width() {
    let mut config = NetworkConfig::default();
    config.protocol.header_width = HeaderWidth::Two;
    config.protocol.max_payload_size = 70_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("does not fit a 2-byte header")));

    config.protocol.max_payload_size = 65_535;
    assert!(config.validate().is_empty());
}

#[test]
fn test_excessive_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.protocol.max_payload_size = 200 * 1024 * 1024;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_zero_read_buffer() {
    let mut config = NetworkConfig::default();
    config.protocol.read_buffer_size = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Read buffer size cannot be 0")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_multiple_errors_collected() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();
    config.server.max_connections = 0;
    config.protocol.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors.len() >= 3, "Expected at least 3 errors, got {errors:?}");
}

#[test]
fn test_validate_strict_reports_all() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;
    config.logging.app_name = String::new();

    let err = config.validate_strict().expect_err("should fail").to_string();
    assert!(err.contains("Max connections"));
    assert!(err.contains("Application name"));
}

#[test]
fn test_toml_full_document() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:9000"
        max_connections = 32
        idle_timeout = 1500
        session_limit = 4
        dispatch_mode = "concurrent"

        [protocol]
        header_width = 2
        byte_order = "little"
        encoding = "msgpack"
        max_payload_size = 4096

        [logging]
        log_level = "debug"
        json_format = true
        "#,
    )
    .expect("valid TOML");

    assert_eq!(config.server.address, "0.0.0.0:9000");
    assert_eq!(config.server.max_connections, 32);
    assert_eq!(config.server.idle_timeout, Duration::from_millis(1500));
    assert_eq!(config.server.session_limit, 4);
    assert_eq!(config.server.dispatch_mode, DispatchMode::Concurrent);
    assert_eq!(config.protocol.header_width, HeaderWidth::Two);
    assert_eq!(config.protocol.byte_order, ByteOrder::Little);
    assert_eq!(config.protocol.encoding, PayloadEncoding::MessagePack);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);
    assert!(config.validate().is_empty());
}

#[test]
fn test_toml_unknown_header_width() {
    let result = NetworkConfig::from_toml("[protocol]\nheader_width = 3\n");
    assert!(result.is_err());
}

#[test]
fn test_save_and_load_round_trip() {
    let path = std::env::temp_dir().join(format!("asyncaproto-config-{}.toml", std::process::id()));
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = 7;
        c.protocol.header_width = HeaderWidth::One;
        c.protocol.max_payload_size = 200;
    });

    config.save_to_file(&path).expect("save");
    let loaded = NetworkConfig::from_file(&path).expect("load");
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.server.max_connections, 7);
    assert_eq!(loaded.protocol.header_width, HeaderWidth::One);
    assert_eq!(loaded.protocol.max_payload_size, 200);
}

#[test]
fn test_missing_file_is_config_error() {
    let result = NetworkConfig::from_file("/definitely/not/here.toml");
    assert!(result.is_err());
}
