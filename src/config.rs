//! Cache Configuration
//!
//! Static configuration for a cache instance plus the subset of options that
//! can be changed at runtime through [`ConfigUpdate`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum entry count
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default number of entry-store shards
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Default write-behind flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-call backing store timeout
pub const DEFAULT_BACKING_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default write-behind retry budget
pub const DEFAULT_MAX_FLUSH_RETRIES: u32 = 3;

/// Default base delay between write-behind retries
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// What a generic `set` does with the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Persist synchronously, then update the cache
    #[default]
    Through,
    /// Update the cache, persist later from the queue
    Behind,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Through => write!(f, "write-through"),
            WriteMode::Behind => write!(f, "write-behind"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// TTL applied when a caller does not pick one (None = never expires)
    pub default_ttl: Option<Duration>,
    /// Write-behind flush period
    pub flush_interval: Duration,
    /// Refresh a hit whose remaining TTL drops below this fraction of its TTL
    pub refresh_threshold_fraction: Option<f64>,
    /// Timeout for every backing store call
    pub backing_store_timeout: Duration,
    /// Write-behind retries before a write is reported as exhausted
    pub max_flush_retries: u32,
    /// Base delay for exponential write-behind backoff
    pub retry_backoff: Duration,
    /// Period of the optional expired-entry sweep
    pub sweep_interval: Option<Duration>,
    /// Number of entry-store shards (power of two)
    pub shard_count: usize,
    /// Behaviour of the generic `set`
    pub write_mode: WriteMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            refresh_threshold_fraction: None,
            backing_store_timeout: DEFAULT_BACKING_STORE_TIMEOUT,
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            sweep_interval: None,
            shard_count: DEFAULT_SHARD_COUNT,
            write_mode: WriteMode::default(),
        }
    }
}

impl CacheConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum entry count
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the write-behind flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enable refresh-ahead at the given fraction of TTL
    pub fn with_refresh_threshold(mut self, fraction: f64) -> Self {
        self.refresh_threshold_fraction = Some(fraction);
        self
    }

    /// Set the backing store timeout
    pub fn with_backing_store_timeout(mut self, timeout: Duration) -> Self {
        self.backing_store_timeout = timeout;
        self
    }

    /// Set the write-behind retry budget
    pub fn with_max_flush_retries(mut self, retries: u32) -> Self {
        self.max_flush_retries = retries;
        self
    }

    /// Set the write-behind retry base delay
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Enable the periodic expired-entry sweep
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the shard count
    pub fn with_shard_count(mut self, shards: usize) -> Self {
        self.shard_count = shards;
        self
    }

    /// Set the generic `set` behaviour
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::CapacityMisconfigured(
                "capacity must be > 0".into(),
            ));
        }
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(Error::CapacityMisconfigured(format!(
                "shard_count must be a power of 2, got {}",
                self.shard_count
            )));
        }
        if let Some(ttl) = self.default_ttl {
            if ttl.is_zero() {
                return Err(Error::InvalidTtl("default_ttl must be > 0".into()));
            }
        }
        if let Some(fraction) = self.refresh_threshold_fraction {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(Error::Config(format!(
                    "refresh_threshold_fraction must be in (0, 1), got {}",
                    fraction
                )));
            }
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be > 0".into()));
        }
        if self.backing_store_timeout.is_zero() {
            return Err(Error::Config("backing_store_timeout must be > 0".into()));
        }
        if matches!(self.sweep_interval, Some(d) if d.is_zero()) {
            return Err(Error::Config("sweep_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Runtime-adjustable options; `None` leaves the current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub capacity: Option<usize>,
    pub default_ttl: Option<Option<Duration>>,
    pub flush_interval: Option<Duration>,
}

impl ConfigUpdate {
    /// Apply onto a config, validating the result
    pub(crate) fn apply_to(&self, config: &CacheConfig) -> Result<CacheConfig> {
        let mut next = config.clone();
        if let Some(capacity) = self.capacity {
            next.capacity = capacity;
        }
        if let Some(ttl) = self.default_ttl {
            next.default_ttl = ttl;
        }
        if let Some(interval) = self.flush_interval {
            next.flush_interval = interval;
        }
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.write_mode, WriteMode::Through);
        assert!(config.default_ttl.is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig::new().with_capacity(0);
        assert_matches!(config.validate(), Err(Error::CapacityMisconfigured(_)));
    }

    #[test]
    fn test_shard_count_must_be_power_of_two() {
        let config = CacheConfig::new().with_shard_count(12);
        assert_matches!(config.validate(), Err(Error::CapacityMisconfigured(_)));
    }

    #[test]
    fn test_zero_default_ttl_rejected() {
        let config = CacheConfig::new().with_default_ttl(Duration::ZERO);
        assert_matches!(config.validate(), Err(Error::InvalidTtl(_)));
    }

    #[test]
    fn test_refresh_fraction_bounds() {
        assert!(CacheConfig::new().with_refresh_threshold(0.1).validate().is_ok());
        assert_matches!(
            CacheConfig::new().with_refresh_threshold(1.5).validate(),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::new().with_refresh_threshold(0.0).validate(),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_config_update_partial() {
        let config = CacheConfig::new().with_capacity(10);
        let update = ConfigUpdate {
            capacity: Some(4),
            default_ttl: Some(Some(Duration::from_secs(30))),
            ..Default::default()
        };
        let next = update.apply_to(&config).unwrap();
        assert_eq!(next.capacity, 4);
        assert_eq!(next.default_ttl, Some(Duration::from_secs(30)));
        assert_eq!(next.flush_interval, config.flush_interval);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let config = CacheConfig::default();
        let update = ConfigUpdate {
            capacity: Some(0),
            ..Default::default()
        };
        assert_matches!(update.apply_to(&config), Err(Error::CapacityMisconfigured(_)));
    }

    #[test]
    fn test_config_serde() {
        let config = CacheConfig::new()
            .with_capacity(128)
            .with_write_mode(WriteMode::Behind);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"write_mode\":\"behind\""));

        let parsed: CacheConfig = serde_json::from_str(r#"{"capacity": 7}"#).unwrap();
        assert_eq!(parsed.capacity, 7);
        assert_eq!(parsed.shard_count, DEFAULT_SHARD_COUNT);
    }
}
