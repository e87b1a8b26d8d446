// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration, loaded from the TOML file whose path arrives as
// argv[1].

use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::heap::NodeAddr;

fn default_poll_interval_us() -> u64 {
    100_000
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// This node's endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// RPC endpoint, `ip:port`.
    pub addr: String,
    /// Port the migration loader listens on.
    pub loader_port: u16,
}

/// A peer node eligible as a migration destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Peer RPC endpoint, `ip:port`.
    pub addr: String,
    pub loader_port: u16,
}

/// Pressure-monitor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Free memory the node tries to keep available. Zero disables the
    /// real probe; pressure then only comes from the mock (tests).
    #[serde(default)]
    pub reserve_mem_mbs: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: default_poll_interval_us(),
            reserve_mem_mbs: 0,
        }
    }
}

impl RuntimeConfig {
    /// Load and parse the config file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse config text. Malformed content is an `InvalidData` error.
    pub fn parse(text: &str) -> io::Result<Self> {
        let cfg: Self = toml::from_str(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        cfg.node_addr()?;
        for p in &cfg.peers {
            parse_addr(&p.addr)?;
        }
        Ok(cfg)
    }

    pub fn node_addr(&self) -> io::Result<NodeAddr> {
        parse_addr(&self.node.addr)
    }

    pub fn peer_addrs(&self) -> io::Result<Vec<(NodeAddr, u16)>> {
        self.peers
            .iter()
            .map(|p| Ok((parse_addr(&p.addr)?, p.loader_port)))
            .collect()
    }
}

fn parse_addr(s: &str) -> io::Result<NodeAddr> {
    s.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad addr {s:?}: {e}")))
}
