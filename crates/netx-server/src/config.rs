//! Server configuration: TOML file + CLI overrides.

use netx_core::connection::{ConnectionOptions, DEFAULT_CLOSE_GRACE};
use netx_core::endpoint::DEFAULT_TIMEOUT_MS;
use netx_core::frame::DEFAULT_MAX_FRAME_LEN;
use netx_core::handshake::PROTOCOL_VERSION;
use netx_core::{CipherAlgorithm, NetxError, NetxResult};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Ports a configured server may listen on.
pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            algorithm: default_algorithm(),
            default_timeout_ms: default_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4590
}
fn default_algorithm() -> String {
    CipherAlgorithm::default().name().to_string()
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_close_grace_ms() -> u64 {
    DEFAULT_CLOSE_GRACE.as_millis() as u64
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub algorithm: CipherAlgorithm,
    pub default_timeout: Duration,
    pub max_frame_len: usize,
    pub close_grace: Duration,
    /// Version a client must announce to be admitted.
    pub protocol_version: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            algorithm: CipherAlgorithm::default(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            close_grace: DEFAULT_CLOSE_GRACE,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_algorithm: Option<&str>,
    ) -> NetxResult<Self> {
        // Load base config from file
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config.server, cli_host, cli_port, cli_algorithm)
    }

    fn parse(content: &str) -> NetxResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| NetxError::Config(format!("config parse error: {e}")))
    }

    fn resolve(
        section: ServerSection,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_algorithm: Option<&str>,
    ) -> NetxResult<Self> {
        // Merge CLI overrides
        let host = cli_host.map(str::to_string).unwrap_or(section.host);
        let port = cli_port.unwrap_or(section.port);
        let algorithm = cli_algorithm
            .unwrap_or(&section.algorithm)
            .parse::<CipherAlgorithm>()
            .map_err(|e| NetxError::Config(e.to_string()))?;

        let config = Self {
            host,
            port,
            algorithm,
            default_timeout: Duration::from_millis(section.default_timeout_ms),
            max_frame_len: section.max_frame_len,
            close_grace: Duration::from_millis(section.close_grace_ms),
            protocol_version: PROTOCOL_VERSION,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> NetxResult<()> {
        if !PORT_RANGE.contains(&self.port) {
            return Err(NetxError::Config(format!(
                "port {} outside {}..={}",
                self.port,
                PORT_RANGE.start(),
                PORT_RANGE.end()
            )));
        }
        if self.max_frame_len == 0 {
            return Err(NetxError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            algorithm: self.algorithm,
            max_frame_len: self.max_frame_len,
            close_grace: self.close_grace,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
