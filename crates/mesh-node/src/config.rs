//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, for logs.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Transport and local host, `scheme:host`.
    pub network: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Data directory; router and peer stores live under it.
    pub data_dir: PathBuf,
    /// Chain coordinate as 12 hex characters.
    #[serde(default = "default_chain_coord")]
    pub chain_coord: String,
    /// Evil-score ban threshold. When absent, the peer config's value
    /// is propagated to the router.
    pub ban_evil_score: Option<u16>,
    /// Handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Addresses to dial at startup.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
}

fn default_node_name() -> String {
    "mesh-node".to_string()
}

fn default_port() -> u16 {
    7740
}

fn default_chain_coord() -> String {
    "000000000000".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            network: "tcp:0.0.0.0".to_string(),
            port: default_port(),
            data_dir: PathBuf::from("./mesh-data"),
            chain_coord: default_chain_coord(),
            ban_evil_score: None,
            handshake_timeout_secs: default_handshake_timeout(),
            seed_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file, then apply command-line overrides. A
    /// missing file yields the defaults.
    pub fn load(path: &Path, args: &Args) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {:?}", path))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {:?}", path))?
        } else {
            Self::default()
        };

        if let Some(network) = &args.network {
            config.network = network.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        config.seed_nodes.extend(args.seed.iter().cloned());

        Ok(config)
    }

    /// Parse the configured chain coordinate.
    pub fn parse_chain_coord(&self) -> Result<mesh_router::ChainCoord> {
        let raw = hex::decode(&self.chain_coord)
            .with_context(|| format!("chain_coord is not hex: {}", self.chain_coord))?;
        let bytes: [u8; mesh_router::COORD_SIZE] = raw
            .as_slice()
            .try_into()
            .context("chain_coord must be 6 bytes")?;
        Ok(mesh_router::ChainCoord::new(bytes))
    }

    /// Store path for the router's physical-connection records.
    pub fn router_store_path(&self) -> PathBuf {
        self.data_dir.join("conns")
    }

    /// Store path for the peer manager's node records.
    pub fn node_store_path(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 7740);
        assert_eq!(config.parse_chain_coord().unwrap(), mesh_router::ChainCoord::default());
    }

    #[test]
    fn test_parse_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            network = "tcp:0.0.0.0"
            data_dir = "/var/lib/mesh"
            chain_coord = "0a0b0c0d0e0f"
            seed_nodes = ["seed1.example.com:7740"]
            "#,
        )
        .unwrap();

        assert_eq!(config.network, "tcp:0.0.0.0");
        assert_eq!(config.seed_nodes.len(), 1);
        assert_eq!(
            config.parse_chain_coord().unwrap(),
            mesh_router::ChainCoord::new([10, 11, 12, 13, 14, 15])
        );
    }
}
