//! # Configuration Management
//!
//! Centralized configuration for a session peer.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` or strings via `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Sections
//! - `session`: identity, roster limits, heartbeat pacing and chunking threshold
//! - `transport`: framing limits for stream transports
//! - `logging`: subscriber setup consumed by `utils::logging::init_logging`

use crate::error::{ProtocolError, Result};
use crate::protocol::chunking::{CHUNK_HEADER_LEN, MAX_CHUNK_COUNT};
use crate::protocol::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RTT_CEILING};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Messages above this many bytes are split into chunks.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest frame a stream transport will accept from the wire.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Top-level configuration for a `NetworkSystem`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
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

    /// Defaults with `SESSION_NET_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlay `SESSION_NET_*` variables onto this configuration.
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("SESSION_NET_DISPLAY_NAME") {
            self.session.display_name = name;
        }

        if let Ok(interval) = std::env::var("SESSION_NET_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                self.session.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("SESSION_NET_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                self.session.max_message_size = val;
            }
        }
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
        errors.extend(self.session.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());

        // A single chunk has to fit through the stream codec.
        if self.session.max_message_size + CHUNK_HEADER_LEN > self.transport.max_frame_size {
            errors.push(format!(
                "Max message size {} plus chunk header exceeds transport max frame size {}",
                self.session.max_message_size, self.transport.max_frame_size
            ));
        }

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

/// Session identity, roster and pacing settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name this peer introduces itself with in UserInfo
    pub display_name: String,

    /// Name the host advertises in ServerInfo
    pub server_name: String,

    /// Roster size limit, also advertised as max players
    pub max_connections: usize,

    /// Minimum spacing between host ping broadcasts
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Stored RTT samples are clamped to this
    #[serde(with = "duration_serde")]
    pub rtt_ceiling: Duration,

    /// Frames larger than this are sent as chunks
    pub max_message_size: usize,

    /// Warn when a single tick drains more frames than this from one connection
    pub intake_capacity_warning: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: String::from("player"),
            server_name: String::from("session"),
            max_connections: 64,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rtt_ceiling: DEFAULT_RTT_CEILING,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            intake_capacity_warning: 4096,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.display_name.is_empty() {
            errors.push("Display name cannot be empty".to_string());
        } else if self.display_name.len() > 64 {
            errors.push(format!(
                "Display name too long: {} characters (maximum: 64)",
                self.display_name.len()
            ));
        }

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > u32::MAX as usize {
            errors.push(format!(
                "Max connections too large: {} (maximum: {})",
                self.max_connections,
                u32::MAX
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 60 {
            errors.push("Heartbeat interval too long (maximum: 60s)".to_string());
        }

        if self.rtt_ceiling.is_zero() {
            errors.push("RTT ceiling must be greater than 0".to_string());
        }

        if self.max_message_size < 256 {
            errors.push("Max message size too small (minimum: 256 bytes)".to_string());
        } else if self.max_message_size.saturating_mul(MAX_CHUNK_COUNT as usize) > u32::MAX as usize {
            errors.push(format!(
                "Max message size too large: {} bytes (chunked messages would overflow)",
                self.max_message_size
            ));
        }

        if self.intake_capacity_warning == 0 {
            errors.push("Intake capacity warning must be greater than 0".to_string());
        }

        errors
    }
}

/// Stream transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest length-delimited frame accepted from a stream
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
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

    /// Default level when `RUST_LOG` is not set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-net"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
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
        let millis = duration.as_millis() as u64;
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
