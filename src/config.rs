use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Work;

/// Configuration for a CinderDB store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory path for the store (index file, bucket table, lock file).
    pub dir: PathBuf,

    /// Number of leading key bits routed into the bucket table; the table
    /// holds 2^index_bits buckets (default: 24, maximum: 32).
    pub index_bits: u8,

    /// How often the background flusher commits outstanding work (default: 1s).
    pub sync_interval: Duration,

    /// Outstanding work threshold below which write back-pressure never
    /// engages (default: 4MiB).
    pub burst_rate: Work,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            index_bits: 24,
            sync_interval: Duration::from_secs(1),
            burst_rate: 4 * 1024 * 1024, // 4MiB
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the number of bucket-routing bits
    pub fn index_bits(mut self, bits: u8) -> Self {
        self.index_bits = bits;
        self
    }

    /// Set the background flush interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the back-pressure burst threshold
    pub fn burst_rate(mut self, rate: Work) -> Self {
        self.burst_rate = rate;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.index_bits > 32 {
            return Err(Error::IndexTooLarge);
        }
        if self.sync_interval.is_zero() {
            return Err(Error::invalid_input("sync_interval must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.index_bits, 24);
        assert_eq!(config.sync_interval, Duration::from_secs(1));
        assert_eq!(config.burst_rate, 4 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .index_bits(16)
            .sync_interval(Duration::from_millis(500))
            .burst_rate(1024);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.index_bits, 16);
        assert_eq!(config.sync_interval, Duration::from_millis(500));
        assert_eq!(config.burst_rate, 1024);
    }

    #[test]
    fn test_config_validation() {
        let config = StoreConfig::default().index_bits(33);
        assert_eq!(config.validate(), Err(Error::IndexTooLarge));

        let config = StoreConfig::default().sync_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
