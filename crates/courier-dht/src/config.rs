//! DHT configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// DHT node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Capacity of each k-bucket
    pub k_bucket_size: usize,
    /// Capacity of the sibling bucket
    pub sibling_bucket_size: usize,
    /// Peers queried in parallel per lookup round
    pub alpha: usize,
    /// Round ceiling for one iterative lookup
    pub max_lookup_rounds: usize,
    /// Time ceiling for one iterative lookup
    pub lookup_timeout_secs: u64,
    /// How long a round waits for responses
    pub response_timeout_secs: u64,
    /// Proof-of-work required on incoming store requests
    pub hashcash_bits: u32,
    /// Days a stamp stays valid around its mint date
    pub hashcash_validity_days: i64,
    /// Root directory for stored packets and the deletion log
    pub storage_path: String,
    /// Maximum bytes of stored packets per packet type
    pub max_storage_bytes: u64,
    /// Days after which stored packets and deletion records are purged
    pub retention_days: u64,
    /// Interval between maintenance runs
    pub maintenance_interval_secs: u64,
    /// Buckets not refreshed for this long are refreshed by maintenance
    pub bucket_refresh_secs: u64,
    /// File the routing table is saved to, one peer per line
    pub peer_file: Option<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k_bucket_size: crate::K,
            sibling_bucket_size: crate::S,
            alpha: crate::ALPHA,
            max_lookup_rounds: 20,
            lookup_timeout_secs: 300,
            response_timeout_secs: 60,
            hashcash_bits: 16,
            hashcash_validity_days: 2,
            storage_path: "./dht_storage".to_string(),
            max_storage_bytes: 1024 * 1024 * 1024, // 1 GB
            retention_days: 100,
            maintenance_interval_secs: 600,
            bucket_refresh_secs: 3600,
            peer_file: None,
        }
    }
}

impl DhtConfig {
    /// Create with custom storage path
    pub fn with_storage_path(path: impl Into<String>) -> Self {
        Self {
            storage_path: path.into(),
            ..Default::default()
        }
    }

    /// Storage root as a path
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }

    /// Lookup ceiling as Duration
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    /// Per-round response wait as Duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Retention as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }

    /// Maintenance interval as Duration
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Bucket staleness threshold as Duration
    pub fn bucket_refresh(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.k_bucket_size == 0 {
            return Err("k_bucket_size must be > 0".to_string());
        }
        if self.sibling_bucket_size < self.k_bucket_size {
            return Err("sibling_bucket_size must be >= k_bucket_size".to_string());
        }
        if self.alpha == 0 {
            return Err("alpha must be > 0".to_string());
        }
        if self.max_lookup_rounds == 0 {
            return Err("max_lookup_rounds must be > 0".to_string());
        }
        if self.response_timeout_secs == 0 || self.lookup_timeout_secs == 0 {
            return Err("timeouts must be > 0".to_string());
        }
        if self.hashcash_bits > 64 {
            return Err("hashcash_bits must be <= 64".to_string());
        }
        if self.hashcash_validity_days < 0 {
            return Err("hashcash_validity_days must be >= 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DhtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.k_bucket_size, 20);
        assert_eq!(config.sibling_bucket_size, 100);
        assert_eq!(config.alpha, 10);
        assert_eq!(config.retention(), Duration::from_secs(100 * 24 * 3600));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = DhtConfig::default();
        config.sibling_bucket_size = 5;
        assert!(config.validate().is_err());

        let mut config = DhtConfig::default();
        config.alpha = 0;
        assert!(config.validate().is_err());
    }
}
