//! Client configuration at `~/.netx/config.toml`.
//!
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use netx_client::ClientConfig;
use netx_core::CipherAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
}

/// `[client]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub max_frame_len: Option<usize>,
    #[serde(default)]
    pub close_grace_ms: Option<u64>,
    /// Override the announced protocol version.
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            algorithm: default_algorithm(),
            default_timeout_ms: default_timeout_ms(),
            max_frame_len: None,
            close_grace_ms: None,
            protocol_version: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4590
}

fn default_algorithm() -> String {
    CipherAlgorithm::default().name().to_string()
}

fn default_timeout_ms() -> u64 {
    netx_core::DEFAULT_TIMEOUT_MS
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Resolve connection settings, letting CLI flags win.
    pub fn client_config(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        algorithm: Option<&str>,
    ) -> Result<ClientConfig> {
        let section = &self.client;
        let algorithm_name = algorithm.unwrap_or(&section.algorithm);
        let algorithm = algorithm_name
            .parse::<CipherAlgorithm>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid algorithm '{algorithm_name}'"))?;

        let mut config = ClientConfig::new(host.unwrap_or(&section.host), port.unwrap_or(section.port));
        config.algorithm = algorithm;
        config.default_timeout = Duration::from_millis(section.default_timeout_ms);
        if let Some(max) = section.max_frame_len {
            config.max_frame_len = max;
        }
        if let Some(ms) = section.close_grace_ms {
            config.close_grace = Duration::from_millis(ms);
        }
        if let Some(version) = section.protocol_version {
            config.protocol_version = version;
        }
        Ok(config)
    }
}
