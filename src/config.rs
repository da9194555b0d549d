//! MirrorSync Configuration
//!
//! Configuration for a mirrored replica pair: coordination strategy,
//! reconnect backoff ceiling, confirmation wait window, and the local-first
//! delta-sync debounce.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::DEFAULT_MAX_DELAY_MS;
use crate::error::{Error, Result};
use crate::strategy::Strategy;

/// Main mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Coordination strategy for the mirrored pair
    #[serde(default)]
    pub strategy: Strategy,

    /// Retry replication on transient failures
    #[serde(default = "default_true")]
    pub retry: bool,

    /// Ceiling for a single reconnect delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Confirmation wait window in milliseconds
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Debounce window for local-first delta syncs in milliseconds
    #[serde(default = "default_debounce_interval_ms")]
    pub debounce_interval_ms: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_confirm_timeout_ms() -> u64 {
    4900
}

fn default_debounce_interval_ms() -> u64 {
    1000
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            retry: true,
            max_backoff_ms: default_max_backoff_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            debounce_interval_ms: default_debounce_interval_ms(),
        }
    }
}

impl MirrorConfig {
    /// Configuration for the given strategy with all defaults
    pub fn for_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_backoff_ms == 0 {
            return Err(Error::Config(
                "max_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.confirm_timeout_ms == 0 {
            return Err(Error::Config(
                "confirm_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.debounce_interval_ms == 0 {
            return Err(Error::Config(
                "debounce_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Confirmation wait window as a [`Duration`]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Delta-sync debounce window as a [`Duration`]
    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }
}
