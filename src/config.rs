//! # Configuration Management
//!
//! Centralized configuration for connections, certified-delivery retries,
//! translator pipelines, remote invocation and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`PEERLINK_*` variables)
//!
//! ## Retry Schedule
//! Certified messages are retransmitted on a bounded exponential backoff:
//! attempt `n` (0-based) waits `min(initial_backoff * multiplier^n, max_backoff)`
//! and the message fails after `max_attempts` transmissions without an
//! acknowledgment.

use crate::error::{ProtocolError, Result};
use crate::translator::compression::CompressionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes to identify transport packets ("PLNK")
pub const MAGIC_BYTES: [u8; 4] = [0x50, 0x4C, 0x4E, 0x4B];

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default key block size of the encryption translator
pub const DEFAULT_KEY_BLOCK_BITS: usize = 1024;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PeerConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub translator: TranslatorConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PeerConfig {
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

    /// Defaults overridden by `PEERLINK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("PEERLINK_QUEUE_CAPACITY") {
            config.connection.queue_capacity = val;
        }

        if let Some(val) = env_parse::<u64>("PEERLINK_CONNECTION_TIMEOUT_MS") {
            config.connection.connection_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("PEERLINK_KEEPALIVE_INTERVAL_MS") {
            config.connection.keepalive_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u32>("PEERLINK_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = val;
        }

        if let Some(val) = env_parse::<u64>("PEERLINK_REMOTE_TIMEOUT_MS") {
            config.remote.invocation_timeout = Duration::from_millis(val);
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

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.retry.validate());
        errors.extend(self.translator.validate());
        errors.extend(self.remote.validate());
        errors.extend(self.logging.validate());
        errors
    }

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

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Per-connection queueing and liveness settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum pending messages (queued plus certified in flight)
    pub queue_capacity: usize,

    /// Force-close after this long without inbound traffic
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Send a keep-alive frame after this long without outbound traffic
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// How long `close()` waits for outstanding certified messages
    #[serde(with = "duration_serde")]
    pub close_grace: Duration,

    /// Sleep between updates of a background driver
    #[serde(with = "duration_serde")]
    pub update_interval: Duration,

    /// Number of recently received certified ids remembered for duplicate detection
    pub duplicate_window: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
            close_grace: timeout::CLOSE_GRACE,
            update_interval: timeout::UPDATE_INTERVAL,
            duplicate_window: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 1_000_000 {
            errors.push(format!(
                "Queue capacity too large: {} (max recommended: 1,000,000)",
                self.queue_capacity
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.keepalive_interval >= self.connection_timeout {
            errors.push("Keep-alive interval must be shorter than the connection timeout".to_string());
        }

        if self.close_grace.as_secs() > 60 {
            errors.push("Close grace period too long (maximum: 60s)".to_string());
        }

        if self.update_interval.is_zero() {
            errors.push("Update interval must be greater than 0".to_string());
        }

        if self.duplicate_window == 0 {
            errors.push("Duplicate window must be greater than 0".to_string());
        }

        errors
    }
}

/// Certified-delivery retry schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Wait before the first retransmission
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Growth factor applied per attempt
    pub multiplier: f64,

    /// Upper bound on any single wait
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,

    /// Transmissions (including the first) before the message fails
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(4),
            max_attempts: 6,
        }
    }
}

impl RetryConfig {
    /// Wait after transmission number `attempt` (0-based) before retrying
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Worst-case time from first transmission until the message fails
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts).map(|n| self.backoff(n)).sum()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_attempts == 0 {
            errors.push("Retry max attempts must be greater than 0".to_string());
        }

        if self.initial_backoff.as_millis() < 1 {
            errors.push("Initial backoff too short (minimum: 1ms)".to_string());
        }

        if self.max_backoff < self.initial_backoff {
            errors.push("Max backoff cannot be shorter than the initial backoff".to_string());
        }

        if !(1.0..=10.0).contains(&self.multiplier) {
            errors.push(format!(
                "Invalid backoff multiplier: {} (valid range: 1.0-10.0)",
                self.multiplier
            ));
        }

        errors
    }
}

/// Translator pipeline settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranslatorConfig {
    pub encryption_enabled: bool,

    /// Key block size in bits; plaintext chunks are `bits / 8 - 4` bytes
    pub key_block_bits: usize,

    pub compression_enabled: bool,

    pub compression_kind: CompressionKind,

    /// Payloads smaller than this bypass compression
    pub compression_threshold_bytes: usize,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: false,
            key_block_bits: DEFAULT_KEY_BLOCK_BITS,
            compression_enabled: false,
            compression_kind: CompressionKind::Lz4,
            compression_threshold_bytes: 512,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TranslatorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.key_block_bits % 8 != 0 {
            errors.push(format!(
                "Key block bits must be a multiple of 8: {}",
                self.key_block_bits
            ));
        }
        if !(64..=32_768).contains(&self.key_block_bits) {
            errors.push(format!(
                "Key block bits out of range: {} (valid range: 64-32768)",
                self.key_block_bits
            ));
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression_enabled && self.compression_threshold_bytes > self.max_payload_size {
            errors.push("Compression threshold cannot be larger than max payload size".to_string());
        }

        errors
    }
}

/// Remote invocation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Default wait for proxy lookups and invocations
    #[serde(with = "duration_serde")]
    pub invocation_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: timeout::REMOTE_TIMEOUT,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.invocation_timeout.as_millis() < 10 {
            errors.push("Invocation timeout too short (minimum: 10ms)".to_string());
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerlink"),
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
        level.as_str().to_lowercase().serialize(serializer)
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
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(250));
        assert_eq!(retry.backoff(1), Duration::from_millis(500));
        assert_eq!(retry.backoff(2), Duration::from_millis(1000));
        assert_eq!(retry.backoff(10), Duration::from_secs(4));
    }

    #[test]
    fn test_total_budget_is_bounded() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            max_attempts: 4,
        };
        // 100 + 200 + 300 + 300
        assert_eq!(retry.total_budget(), Duration::from_millis(900));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_toml_roundtrip() {
        let text = PeerConfig::example_config();
        let parsed = PeerConfig::from_toml(&text).expect("example config parses");
        assert_eq!(parsed.connection.queue_capacity, 64);
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }
}
