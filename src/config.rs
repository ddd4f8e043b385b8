//! # Configuration Management
//!
//! Centralized configuration for the client engine.
//!
//! The exact retry ceiling, retransmission interval, reorder timeout, and
//! split-buffer lifetime are deployment policy rather than protocol law, so
//! they live here with documented defaults instead of being baked into the
//! transport code.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Environment variable overrides via `from_env()`
//! - Direct instantiation with defaults

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest map serialization format version this build understands.
pub const SERIALIZE_VER_MAX: u8 = 28;
/// Lowest map serialization format version this build understands.
pub const SERIALIZE_VER_MIN: u8 = 24;
/// Highest network protocol version this build understands.
pub const PROTOCOL_VER_MAX: u16 = 39;
/// Lowest network protocol version this build understands.
pub const PROTOCOL_VER_MIN: u16 = 32;

/// Fixed-point scale for world positions on the wire. Divide the wire
/// integer by this to obtain world units. Build-time convention, never
/// renegotiated.
pub const POS_SCALE: f32 = 1000.0;

/// World units per map block edge, exported for hosts converting positions.
pub const BS: f32 = 10.0;

/// Engine configuration: reliability policy, timeouts, and transport limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Largest datagram payload handed to the socket; larger logical
    /// payloads are split
    pub datagram_limit: usize,

    /// Interval between retransmissions of an unacknowledged reliable packet
    #[serde(with = "duration_serde")]
    pub retransmit_interval: Duration,

    /// Retransmissions attempted before the peer is declared unresponsive
    pub retry_ceiling: u32,

    /// How long an out-of-order packet may block later packets before the
    /// gap is skipped
    #[serde(with = "duration_serde")]
    pub reorder_timeout: Duration,

    /// Age after which an incomplete split buffer is evicted (treated as loss)
    #[serde(with = "duration_serde")]
    pub split_ttl: Duration,

    /// Inactivity window after which a peer is disconnected
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Interval between connection-hello resends while still unanswered,
    /// and between keepalive pings on a quiet active connection
    #[serde(with = "duration_serde")]
    pub hello_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            datagram_limit: 512,
            retransmit_interval: Duration::from_millis(500),
            retry_ceiling: 8,
            reorder_timeout: Duration::from_secs(1),
            split_ttl: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            hello_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, starting from defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(limit) = std::env::var("VOXELNET_DATAGRAM_LIMIT") {
            if let Ok(val) = limit.parse::<usize>() {
                config.datagram_limit = val;
            }
        }

        if let Ok(interval) = std::env::var("VOXELNET_RETRANSMIT_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.retransmit_interval = Duration::from_millis(val);
            }
        }

        if let Ok(ceiling) = std::env::var("VOXELNET_RETRY_CEILING") {
            if let Ok(val) = ceiling.parse::<u32>() {
                config.retry_ceiling = val;
            }
        }

        if let Ok(timeout) = std::env::var("VOXELNET_REORDER_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.reorder_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(ttl) = std::env::var("VOXELNET_SPLIT_TTL_MS") {
            if let Ok(val) = ttl.parse::<u64>() {
                config.split_ttl = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("VOXELNET_IDLE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.idle_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(interval) = std::env::var("VOXELNET_HELLO_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.hello_interval = Duration::from_millis(val);
            }
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

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.datagram_limit < 64 {
            errors.push("Datagram limit too small (minimum: 64 bytes)".to_string());
        } else if self.datagram_limit > 65_507 {
            errors.push(format!(
                "Datagram limit exceeds UDP maximum: {} (maximum: 65507)",
                self.datagram_limit
            ));
        }

        if self.retransmit_interval.as_millis() < 10 {
            errors.push("Retransmit interval too short (minimum: 10ms)".to_string());
        } else if self.retransmit_interval.as_secs() > 10 {
            errors.push("Retransmit interval too long (maximum: 10s)".to_string());
        }

        if self.retry_ceiling == 0 {
            errors.push("Retry ceiling must be greater than 0".to_string());
        } else if self.retry_ceiling > 100 {
            errors.push(format!(
                "Retry ceiling very high: {} (peer failure detection will be slow)",
                self.retry_ceiling
            ));
        }

        if self.reorder_timeout < self.retransmit_interval {
            errors.push(
                "Reorder timeout shorter than retransmit interval (gaps will be skipped before \
                 the missing packet can be retransmitted)"
                    .to_string(),
            );
        }

        if self.split_ttl.as_secs() < 1 {
            errors.push("Split buffer TTL too short (minimum: 1s)".to_string());
        }

        if self.idle_timeout.as_secs() < 1 {
            errors.push("Idle timeout too short (minimum: 1s)".to_string());
        }

        if self.hello_interval.as_millis() < 100 {
            errors.push("Hello interval too short (minimum: 100ms)".to_string());
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

/// Helper module for Duration serialization/deserialization (milliseconds)
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
