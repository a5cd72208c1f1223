//! Ledger configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::ledger::validator::Capabilities;
use crate::types::{CurrencyToken, LedgerError, LedgerResult};

/// Top-level configuration for a [`crate::Ledger`].
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Retry policy for transient store errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Deadline applied to each store call (milliseconds).
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Deployment-level capabilities.
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

impl LedgerConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> LedgerResult<Self> {
        toml::from_str(source)
            .map_err(|e| LedgerError::Validation(format!("invalid ledger config: {}", e)))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
            deployment: DeploymentConfig::default(),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Per-environment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Whether authority-sourced transfers are permitted.
    #[serde(default)]
    pub minting_enabled: bool,
    /// Token used for deposits when none is given.
    #[serde(default = "default_token")]
    pub default_token: CurrencyToken,
}

impl DeploymentConfig {
    /// Read deployment flags from the process environment.
    ///
    /// Minting is enabled only when `SELF_HOSTED` is exactly `"true"`.
    pub fn from_env() -> Self {
        let minting_enabled = std::env::var("SELF_HOSTED")
            .map(|value| value == "true")
            .unwrap_or(false);
        Self {
            minting_enabled,
            default_token: default_token(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            minting: self.minting_enabled,
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            minting_enabled: false,
            default_token: default_token(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_token() -> CurrencyToken {
    CurrencyToken::Mana
}
