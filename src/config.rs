//! Node Configuration
//!
//! Settings are read from an optional JSON file and then overridden by command-line
//! flags. Every field has a default so a bare `--bind` is enough to start a
//! single-node cache.

use crate::storage::eviction::EvictionKind;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Local storage engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total number of entries across all segments.
    pub capacity: usize,
    pub segments: usize,
    pub eviction: EvictionKind,
    pub reaper_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            segments: 16,
            eviction: EvictionKind::Lru,
            reaper_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }
}

/// A statically configured cluster peer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PeerConfig {
    pub id: String,
    pub addr: SocketAddr,
}

impl std::str::FromStr for PeerConfig {
    type Err = anyhow::Error;

    /// Parses `id=host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Peer must look like id=host:port, got {}", s))?;
        if id.is_empty() {
            return Err(anyhow::anyhow!("Peer id must not be empty: {}", s));
        }
        Ok(Self {
            id: id.to_string(),
            addr: addr
                .parse()
                .with_context(|| format!("Invalid peer address {}", addr))?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub replication_factor: usize,
    pub virtual_nodes: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub handoff_interval_ms: u64,
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            bind: SocketAddr::from(([127, 0, 0, 1], 11_311)),
            peers: Vec::new(),
            replication_factor: 3,
            virtual_nodes: 64,
            connect_timeout_ms: 500,
            request_timeout_ms: 1_000,
            handoff_interval_ms: 5_000,
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Builds a config from `--config`, then applies the remaining flags on top.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = match flag_value(args, "--config")? {
            Some(path) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {}
                "--bind" => config.bind = required(args, i)?.parse()?,
                "--node-id" => config.node_id = required(args, i)?.to_string(),
                "--peer" => config.peers.push(required(args, i)?.parse()?),
                "--rf" => config.replication_factor = required(args, i)?.parse()?,
                "--capacity" => config.engine.capacity = required(args, i)?.parse()?,
                "--segments" => config.engine.segments = required(args, i)?.parse()?,
                "--eviction" => config.engine.eviction = required(args, i)?.parse()?,
                other => {
                    tracing::warn!("Ignoring unknown argument {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(anyhow::anyhow!("Replication factor must be at least 1"));
        }
        if self.virtual_nodes == 0 {
            return Err(anyhow::anyhow!("Virtual node count must be at least 1"));
        }
        if self.engine.segments == 0 || self.engine.capacity == 0 {
            return Err(anyhow::anyhow!("Engine capacity and segment count must be positive"));
        }
        if self.peers.iter().any(|peer| peer.id == self.node_id) {
            return Err(anyhow::anyhow!("Peer list contains this node's own id {}", self.node_id));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handoff_interval(&self) -> Duration {
        Duration::from_millis(self.handoff_interval_ms.max(1))
    }
}

fn required(args: &[String], i: usize) -> Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", args[i]))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    match args.iter().position(|arg| arg == flag) {
        Some(i) => required(args, i).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cache-node")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.engine.eviction, EvictionKind::Lru);
    }

    #[test]
    fn test_cli_overrides() {
        let config = NodeConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:7000",
            "--node-id",
            "n1",
            "--peer",
            "n2=127.0.0.1:7001",
            "--peer",
            "n3=127.0.0.1:7002",
            "--rf",
            "2",
            "--eviction",
            "lfu",
        ]))
        .unwrap();

        assert_eq!(config.node_id, "n1");
        assert_eq!(config.bind.port(), 7000);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].id, "n3");
        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.engine.eviction, EvictionKind::Lfu);
    }

    #[test]
    fn test_missing_flag_value_is_an_error() {
        assert!(NodeConfig::from_args(&args(&["--bind"])).is_err());
    }

    #[test]
    fn test_zero_replication_factor_rejected() {
        assert!(NodeConfig::from_args(&args(&["--rf", "0"])).is_err());
    }

    #[test]
    fn test_peer_parse() {
        let peer: PeerConfig = "b=10.0.0.2:11311".parse().unwrap();
        assert_eq!(peer.id, "b");
        assert!("no-separator".parse::<PeerConfig>().is_err());
        assert!("=10.0.0.2:11311".parse::<PeerConfig>().is_err());
    }

    #[test]
    fn test_json_config_uses_defaults_for_missing_fields() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"node_id": "a", "engine": {"capacity": 10, "eviction": "lfu"}}"#,
        )
        .unwrap();

        assert_eq!(config.node_id, "a");
        assert_eq!(config.engine.capacity, 10);
        assert_eq!(config.engine.segments, 16);
        assert_eq!(config.engine.eviction, EvictionKind::Lfu);
        assert_eq!(config.virtual_nodes, 64);
    }
}
