//! # Configuration Management
//!
//! Centralized configuration for the application server.
//!
//! The server consumes a single resolved [`NetworkConfig`]: listener and
//! lifecycle settings, wire protocol parameters (header width, byte order,
//! payload encoding, size ceiling) and logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (prefix `ASYNCAPROTO_`)
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! ## Security Considerations
//! - The payload ceiling is enforced on the frame header, before buffering
//! - The idle timeout bounds how long a silent peer can hold a connection slot

use crate::core::client::DEFAULT_OUTBOUND_CAPACITY;
use crate::core::codec::{ByteOrder, FrameConfig, HeaderWidth};
use crate::core::serialization::PayloadEncoding;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::DispatchMode;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8081;

/// Environment variable prefix used by [`NetworkConfig::from_env`]
pub const ENV_PREFIX: &str = "ASYNCAPROTO_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listener and connection lifecycle
    #[serde(default)]
    pub server: ServerConfig,

    /// Wire protocol parameters
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {ENV_PREFIX}{name}: '{raw}'"))),
        None => Ok(None),
    }
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Unparseable values are an error rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("ADDRESS") {
            config.server.address = addr;
        }
        if let Some(val) = env_parse::<usize>("MAX_CONNECTIONS")? {
            config.server.max_connections = val;
        }
        if let Some(val) = env_parse::<u64>("IDLE_TIMEOUT_MS")? {
            config.server.idle_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("SHUTDOWN_TIMEOUT_MS")? {
            config.server.shutdown_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<usize>("SESSION_LIMIT")? {
            config.server.session_limit = val;
        }
        if let Some(val) = env_parse::<usize>("OUTBOUND_QUEUE_SIZE")? {
            config.server.outbound_queue_size = val;
        }
        if let Some(mode) = env_var("DISPATCH_MODE") {
            config.server.dispatch_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "sequential" => DispatchMode::Sequential,
                "concurrent" => DispatchMode::Concurrent,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid dispatch mode: '{other}' (expected 'sequential' or 'concurrent')"
                    )))
                }
            };
        }

        if let Some(val) = env_parse::<u8>("HEADER_WIDTH")? {
            config.protocol.header_width = HeaderWidth::try_from(val).map_err(ProtocolError::ConfigError)?;
        }
        if let Some(order) = env_var("BYTE_ORDER") {
            config.protocol.byte_order = match order.trim().to_ascii_lowercase().as_str() {
                "big" => ByteOrder::Big,
                "little" => ByteOrder::Little,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid byte order: '{other}' (expected 'big' or 'little')"
                    )))
                }
            };
        }
        if let Some(encoding) = env_var("ENCODING") {
            config.protocol.encoding = match encoding.trim().to_ascii_lowercase().as_str() {
                "json" => PayloadEncoding::Json,
                "messagepack" | "msgpack" => PayloadEncoding::MessagePack,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid payload encoding: '{other}' (expected 'json' or 'messagepack')"
                    )))
                }
            };
        }
        if let Some(val) = env_parse::<usize>("MAX_PAYLOAD_SIZE")? {
            config.protocol.max_payload_size = val;
        }

        if let Some(level) = env_parse::<Level>("LOG_LEVEL")? {
            config.logging.log_level = level;
        }
        if let Some(val) = env_parse::<bool>("LOG_JSON")? {
            config.logging.json_format = val;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.protocol.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener and connection lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:8081")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Close a connection that sends nothing for this long
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Grace period for connections to finish during shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Member limit for sessions created implicitly, 0 = unlimited
    pub session_limit: usize,

    /// How multiple matching handlers run for one packet
    pub dispatch_mode: DispatchMode,

    /// Per-connection outbound queue length; a client that falls this far
    /// behind is disconnected
    pub outbound_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            max_connections: 1000,
            idle_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            session_limit: 0,
            dispatch_mode: DispatchMode::default(),
            outbound_queue_size: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8081')",
                self.address
            ));
        }

        if self.idle_timeout.as_millis() < 10 {
            errors.push("Idle timeout too short (minimum: 10ms)".to_string());
        } else if self.idle_timeout.as_secs() > 86_400 {
            errors.push("Idle timeout too long (maximum: 24h)".to_string());
        }

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.outbound_queue_size == 0 {
            errors.push("Outbound queue size must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Wire protocol configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Length header width in bytes: 1, 2 or 4
    pub header_width: HeaderWidth,

    /// Length header byte order
    pub byte_order: ByteOrder,

    /// Payload encoding
    pub encoding: PayloadEncoding,

    /// Largest accepted payload in bytes
    pub max_payload_size: usize,

    /// Initial read buffer capacity per connection
    pub read_buffer_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            header_width: HeaderWidth::Four,
            byte_order: ByteOrder::Big,
            encoding: PayloadEncoding::Json,
            max_payload_size: MAX_PAYLOAD_SIZE,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl ProtocolConfig {
    /// Framing parameters for [`FrameCodec`](crate::core::codec::FrameCodec)
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            header_width: self.header_width,
            byte_order: self.byte_order,
            max_payload_size: self.max_payload_size,
        }
    }

    /// Validate protocol configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > self.header_width.max_len() {
            errors.push(format!(
                "Max payload size {} does not fit a {}-byte header (maximum: {})",
                self.max_payload_size,
                self.header_width.bytes(),
                self.header_width.max_len()
            ));
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.read_buffer_size == 0 {
            errors.push("Read buffer size cannot be 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("asyncaproto"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.server.address, "127.0.0.1:8081");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [server]
            idle_timeout = 250

            [protocol]
            header_width = 2
            byte_order = "little"
            encoding = "msgpack"
            max_payload_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.server.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.protocol.header_width, HeaderWidth::Two);
        assert_eq!(config.protocol.byte_order, ByteOrder::Little);
        assert_eq!(config.protocol.encoding, PayloadEncoding::MessagePack);
        assert_eq!(config.logging.log_level, Level::INFO);
    }

    #[test]
    fn test_bad_header_width_rejected() {
        let err = NetworkConfig::from_toml("[protocol]\nheader_width = 3\n").unwrap_err();
        assert!(matches!(err, ProtocolError::ConfigError(_)));
    }

    #[test]
    fn test_payload_must_fit_header() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.protocol.header_width = HeaderWidth::One;
            c.protocol.max_payload_size = 1024;
        });
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn test_example_config_round_trips() {
        let text = NetworkConfig::example_config();
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.server.address, ServerConfig::default().address);
        assert_eq!(parsed.server.dispatch_mode, DispatchMode::Sequential);
    }
}
