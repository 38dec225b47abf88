//! Node configuration file

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use courier_dht::DhtConfig;
use courier_relay::RelayConfig;
use serde::{Deserialize, Serialize};

/// Network section
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address to bind
    pub bind_address: String,
    /// Address announced to peers, if different from the bound one
    pub advertised_address: Option<String>,
    /// Peers contacted at startup, as `host:port`
    pub bootstrap: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7661".to_string(),
            advertised_address: None,
            bootstrap: Vec::new(),
        }
    }
}

/// Whole node configuration, read from TOML
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network settings
    pub network: NetworkConfig,
    /// DHT settings
    pub dht: DhtConfig,
    /// Relay settings
    pub relay: RelayConfig,
}

impl NodeConfig {
    /// Read a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parse TOML text
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Put all on-disk state under `dir`
    pub fn set_data_dir(&mut self, dir: &Path) {
        self.dht.storage_path = dir.join("dht").to_string_lossy().into_owned();
        self.dht.peer_file = Some(dir.join("peers.txt").to_string_lossy().into_owned());
        self.relay.queue_path = dir.join("relay_queue").to_string_lossy().into_owned();
    }

    /// Bound address
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .bind_address
            .parse()
            .with_context(|| format!("bad bind address {}", self.network.bind_address))
    }

    /// Advertised address, if configured
    pub fn advertised_address(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.network
            .advertised_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("bad advertised address {}", addr))
            })
            .transpose()
    }

    /// Bootstrap addresses; unparsable entries are reported
    pub fn bootstrap_addresses(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.network
            .bootstrap
            .iter()
            .map(|addr| {
                addr.trim()
                    .parse()
                    .with_context(|| format!("bad bootstrap address {}", addr))
            })
            .collect()
    }

    /// Validate every section
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_address()?;
        self.advertised_address()?;
        self.bootstrap_addresses()?;
        self.dht.validate().map_err(anyhow::Error::msg)?;
        self.relay.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    /// Directory holding the relay queue
    pub fn relay_queue_dir(&self) -> PathBuf {
        self.relay.queue_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = NodeConfig::parse("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.dht.k_bucket_size, courier_dht::K);
        assert!(config.network.bootstrap.is_empty());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = NodeConfig::parse(
            r#"
            [network]
            bind_address = "127.0.0.1:9000"
            bootstrap = ["127.0.0.1:9001", "127.0.0.1:9002"]

            [dht]
            hashcash_bits = 10

            [relay]
            store_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_address().unwrap().port(), 9000);
        assert_eq!(config.bootstrap_addresses().unwrap().len(), 2);
        assert_eq!(config.dht.hashcash_bits, 10);
        assert_eq!(config.relay.store_workers, 4);
        assert_eq!(config.relay.hashcash_bits, 16);
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut config = NodeConfig::default();
        config.network.bootstrap = vec!["not an address".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_moves_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.set_data_dir(dir.path());
        assert!(config.dht.storage_dir().starts_with(dir.path()));
        assert!(config.relay_queue_dir().starts_with(dir.path()));
        assert!(config.dht.peer_file.is_some());
    }
}
