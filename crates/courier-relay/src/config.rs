//! Relay configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Relay node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory holding queued relay packets
    pub queue_path: String,
    /// Proof-of-work required on incoming relay requests
    pub hashcash_bits: u32,
    /// Days a stamp stays valid around its mint date
    pub hashcash_validity_days: i64,
    /// Upper bound on the randomized forwarding delay
    pub max_delay_secs: u64,
    /// Queued packets not forwarded within this time are dropped
    pub max_age_secs: u64,
    /// Interval between relay sender passes
    pub send_interval_secs: u64,
    /// How long the sender waits for the next hop to confirm
    pub send_timeout_secs: u64,
    /// Workers storing relayed packets in the DHT
    pub store_workers: usize,
    /// Store requests waiting for a worker; more are dropped
    pub store_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_path: "./relay_queue".to_string(),
            hashcash_bits: 16,
            hashcash_validity_days: 2,
            max_delay_secs: 6 * 3600,
            max_age_secs: 7 * 24 * 3600,
            send_interval_secs: 30,
            send_timeout_secs: 60,
            store_workers: crate::DEFAULT_STORE_WORKERS,
            store_queue_capacity: crate::DEFAULT_STORE_QUEUE_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Create with a custom queue directory
    pub fn with_queue_path(path: impl Into<String>) -> Self {
        Self {
            queue_path: path.into(),
            ..Default::default()
        }
    }

    /// Queue directory as a path
    pub fn queue_dir(&self) -> PathBuf {
        PathBuf::from(&self.queue_path)
    }

    /// Delay cap as Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Queue entry lifetime as Duration
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Sender interval as Duration
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    /// Forwarding confirmation wait as Duration
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.store_workers == 0 {
            return Err("store_workers must be > 0".to_string());
        }
        if self.store_queue_capacity == 0 {
            return Err("store_queue_capacity must be > 0".to_string());
        }
        if self.send_interval_secs == 0 {
            return Err("send_interval_secs must be > 0".to_string());
        }
        if self.hashcash_bits > 64 {
            return Err("hashcash_bits must be <= 64".to_string());
        }
        if self.max_age_secs < self.max_delay_secs {
            return Err("max_age_secs must be >= max_delay_secs".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_workers, 2);
        assert_eq!(config.store_queue_capacity, 64);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = RelayConfig::default();
        config.store_workers = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_age_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = RelayConfig::with_queue_path("/tmp/relay");
        assert_eq!(config.queue_dir(), PathBuf::from("/tmp/relay"));
        assert_eq!(config.max_delay(), Duration::from_secs(6 * 3600));
        assert_eq!(config.send_interval(), Duration::from_secs(30));
    }
}
