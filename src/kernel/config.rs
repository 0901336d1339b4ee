//! Node configuration
//!
//! Every tunable of the code-management core lives here. Configurations are
//! plain JSON documents; missing fields take the defaults below, which match
//! an ATmega128-class node (256-byte flash pages, 64 KiB code region).

use serde::{Deserialize, Serialize};

/// How the fetch watchdog interval grows between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same interval every retry
    #[default]
    Fixed,
    /// Interval doubles each retry, capped at `max_retry_interval_ms`
    Exponential,
}

/// Configuration for a [`Node`](super::Node)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// First flash byte address of the code region
    pub flash_base: u32,
    /// Flash page size in bytes
    pub page_size: usize,
    /// Pages in the code region
    pub page_count: usize,
    /// Entries in the allocation table (at most 255)
    pub max_allocations: usize,
    /// Payload bytes per fetch fragment
    pub fragment_size: usize,
    /// Concurrent fetches
    pub max_fetches: usize,
    /// Retransmission rounds before a fetch fails
    pub max_retries: u8,
    /// Watchdog interval before the first retry
    pub retry_interval_ms: u64,
    /// Interval growth policy
    pub backoff: Backoff,
    /// Upper bound for exponential backoff
    pub max_retry_interval_ms: u64,
    /// Start with tracing enabled
    pub trace: bool,
    /// Print trace events to the console as they are recorded
    pub echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flash_base: 0x1_0000,
            page_size: 256,
            page_count: 256,
            max_allocations: 16,
            fragment_size: 32,
            max_fetches: 2,
            max_retries: 5,
            retry_interval_ms: 1024,
            backoff: Backoff::Fixed,
            max_retry_interval_ms: 16 * 1024,
            trace: false,
            echo: false,
        }
    }
}

impl Config {
    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject geometries the core cannot operate on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("page_size must be a power of two"));
        }
        if self.page_count == 0 {
            return Err(ConfigError::Invalid("page_count must be non-zero"));
        }
        if self.max_allocations == 0 || self.max_allocations > 255 {
            return Err(ConfigError::Invalid("max_allocations must be 1..=255"));
        }
        if self.fragment_size == 0 || self.fragment_size > 255 {
            return Err(ConfigError::Invalid("fragment_size must be 1..=255"));
        }
        if self.max_fetches == 0 {
            return Err(ConfigError::Invalid("max_fetches must be non-zero"));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("retry_interval_ms must be non-zero"));
        }
        let end = u64::from(self.flash_base) + (self.page_size * self.page_count) as u64;
        if end > u64::from(u32::MAX) + 1 {
            return Err(ConfigError::Invalid("code region exceeds 32-bit address space"));
        }
        Ok(())
    }

    /// Watchdog interval after `retries` retransmissions
    pub fn retry_interval(&self, retries: u8) -> u64 {
        match self.backoff {
            Backoff::Fixed => self.retry_interval_ms,
            Backoff::Exponential => {
                let shift = u32::from(retries).min(16);
                self.retry_interval_ms
                    .saturating_mul(1 << shift)
                    .min(self.max_retry_interval_ms.max(self.retry_interval_ms))
            }
        }
    }

    /// Bytes covered by the code region
    pub fn code_region_size(&self) -> usize {
        self.page_size * self.page_count
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// JSON could not be parsed
    Parse(String),
    /// Values are inconsistent
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "config parse error: {}", e),
            Self::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
