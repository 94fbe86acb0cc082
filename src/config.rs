//! Session tuning loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) gives a usable
//! configuration:
//!
//! ```toml
//! ring_capacity = 4
//! transfers_in_flight = 3
//! bandwidth_factor = 1.3
//! control_range_policy = "clamp"
//!
//! [recovery]
//! max_consecutive_failures = 5
//! failure_window_ms = 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::controls::RangePolicy;
use crate::negotiate::BandwidthFactor;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this structure.
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// A value is out of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// When a run of transfer faults becomes a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Faults in a row (within the window) that escalate to `StreamError`.
    pub max_consecutive_failures: usize,
    /// Faults older than this no longer count toward the streak.
    pub failure_window_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            failure_window_ms: 2000,
        }
    }
}

impl RecoveryConfig {
    /// The failure window as a duration.
    pub const fn failure_window(&self) -> Duration {
        at_least_one_ms(self.failure_window_ms)
    }
}

/// Configuration of one capture session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frame slots between the pump and the retriever.
    pub ring_capacity: usize,
    /// Transfers kept in flight by the pump.
    pub transfers_in_flight: usize,
    /// Longest single wait of the pump before it re-checks for shutdown.
    pub poll_interval_ms: u64,
    /// Wait slice used by robust retrieval between cancellation checks.
    pub robust_poll_timeout_ms: u64,
    /// Default bandwidth factor for `set_mode`.
    pub bandwidth_factor: BandwidthFactor,
    /// Bytes per service interval the host controller grants at most.
    pub host_bandwidth_limit: Option<u32>,
    /// Fault escalation.
    pub recovery: RecoveryConfig,
    /// Out-of-range control writes.
    pub control_range_policy: RangePolicy,
    /// Convert partial frames (flagged incomplete) instead of refusing them.
    pub allow_partial_frames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4,
            transfers_in_flight: 3,
            poll_interval_ms: 50,
            robust_poll_timeout_ms: 1000,
            bandwidth_factor: BandwidthFactor::ONE,
            host_bandwidth_limit: None,
            recovery: RecoveryConfig::default(),
            control_range_policy: RangePolicy::Reject,
            allow_partial_frames: false,
        }
    }
}

impl SessionConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from a string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.ring_capacity >= 2, "ring_capacity must be at least 2"),
            (self.transfers_in_flight >= 1, "transfers_in_flight must be at least 1"),
            (self.poll_interval_ms > 0, "poll_interval_ms must be positive"),
            (self.robust_poll_timeout_ms > 0, "robust_poll_timeout_ms must be positive"),
            (
                self.recovery.max_consecutive_failures >= 1,
                "recovery.max_consecutive_failures must be at least 1",
            ),
            (
                self.recovery.failure_window_ms > 0,
                "recovery.failure_window_ms must be positive",
            ),
            (
                self.host_bandwidth_limit != Some(0),
                "host_bandwidth_limit must be positive when set",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_owned())),
            None => Ok(()),
        }
    }

    /// Pump wait slice, never below 1 ms.
    pub const fn poll_interval(&self) -> Duration {
        at_least_one_ms(self.poll_interval_ms)
    }

    /// Robust retrieval wait slice, never below 1 ms.
    pub const fn robust_poll_timeout(&self) -> Duration {
        at_least_one_ms(self.robust_poll_timeout_ms)
    }
}

const fn at_least_one_ms(millis: u64) -> Duration {
    Duration::from_millis(if millis == 0 { 1 } else { millis })
}
