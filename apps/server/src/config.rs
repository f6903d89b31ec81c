//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides,
//! mirroring the library's load-then-env-override convention.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the fan-out TCP listener to.
    pub bind_addr: IpAddr,

    /// Port to bind the fan-out TCP listener to.
    /// Override: `SNAPSTREAM_BIND_PORT`
    pub bind_port: u16,

    /// Source URIs, one per stream (`scheme://host/path?k=v&...`).
    /// Override: `SNAPSTREAM_SOURCES` (comma-separated).
    pub sources: Vec<String>,

    /// Directory for persistent state (`server.json`).
    /// Override: `SNAPSTREAM_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Enables the opportunistic zero-copy send path where the kernel
    /// supports it.
    pub zerocopy_enabled: bool,

    /// Bounds each session's outbound queue; `0` means unbounded (current
    /// upstream behavior).
    pub max_queue_chunks: usize,

    /// Forwards encoded chunks to muted sessions instead of gating them out
    /// (spec §4.G's documented override).
    pub forward_to_muted_clients: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 1704,
            sources: Vec::new(),
            data_dir: None,
            zerocopy_enabled: true,
            max_queue_chunks: 0,
            forward_to_muted_clients: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SNAPSTREAM_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("SNAPSTREAM_BIND_ADDR") {
            if let Ok(addr) = val.parse() {
                self.bind_addr = addr;
            }
        }

        if let Ok(val) = std::env::var("SNAPSTREAM_SOURCES") {
            let sources: Vec<String> = val.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
            if !sources.is_empty() {
                self.sources = sources;
            }
        }

        if let Ok(val) = std::env::var("SNAPSTREAM_FORWARD_TO_MUTED_CLIENTS") {
            if let Ok(flag) = val.parse() {
                self.forward_to_muted_clients = flag;
            }
        }

        // Note: SNAPSTREAM_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_all_interfaces_on_the_standard_port() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_port, 1704);
        assert_eq!(config.bind_addr, IpAddr::from([0, 0, 0, 0]));
        assert!(config.sources.is_empty());
    }

    #[test]
    fn loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "bind_port: 9000\nsources:\n  - \"pipe:///tmp/a?name=a\"\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.sources, vec!["pipe:///tmp/a?name=a".to_string()]);
    }
}
