//! Configuration file support for lplink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (LPLINK_*)
//! 3. Local config file (./lplink.toml)
//! 4. Global config file (~/.config/lplink/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use lplink::{DiscoveryConfig, LoaderConfig, platform_permissions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "lplink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
}

/// Discovery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Probe timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Firmware release to expect instead of this tool's version.
    pub expected_version: Option<String>,
}

/// Bootstrap loader timeouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderSection {
    /// Timeout for short commands in milliseconds.
    pub command_timeout_ms: Option<u64>,
    /// Timeout for the mass erase in milliseconds.
    pub erase_timeout_ms: Option<u64>,
    /// Timeout for one batch write in milliseconds.
    pub batch_timeout_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Bootstrap loader settings.
    #[serde(default)]
    pub loader: LoaderSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lplink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }

        if other.discovery.timeout_ms.is_some() {
            self.discovery.timeout_ms = other.discovery.timeout_ms;
        }
        if other.discovery.expected_version.is_some() {
            self.discovery.expected_version = other.discovery.expected_version;
        }

        if other.loader.command_timeout_ms.is_some() {
            self.loader.command_timeout_ms = other.loader.command_timeout_ms;
        }
        if other.loader.erase_timeout_ms.is_some() {
            self.loader.erase_timeout_ms = other.loader.erase_timeout_ms;
        }
        if other.loader.batch_timeout_ms.is_some() {
            self.loader.batch_timeout_ms = other.loader.batch_timeout_ms;
        }
    }

    /// Port to use: the command line wins over the config files.
    pub fn port<'a>(&'a self, cli_port: Option<&'a str>) -> Option<&'a str> {
        cli_port.or(self.connection.port.as_deref())
    }

    /// Discovery settings with the command-line overrides applied.
    pub fn discovery_config(&self, port: Option<&str>, timeout_ms: Option<u64>) -> DiscoveryConfig {
        let mut discovery = DiscoveryConfig::default().with_permissions(platform_permissions());

        if let Some(port) = self.port(port) {
            discovery = discovery.with_port(port);
        }
        if let Some(ms) = timeout_ms.or(self.discovery.timeout_ms) {
            discovery = discovery.with_timeout(Duration::from_millis(ms));
        }
        if let Some(version) = &self.discovery.expected_version {
            discovery = discovery.with_expected_version(version.clone());
        }
        discovery
    }

    /// Bootstrap loader timeouts.
    pub fn loader_config(&self) -> LoaderConfig {
        let mut loader = LoaderConfig::default();
        if let Some(ms) = self.loader.command_timeout_ms {
            loader = loader.with_command_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.loader.erase_timeout_ms {
            loader = loader.with_erase_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.loader.batch_timeout_ms {
            loader = loader.with_batch_timeout(Duration::from_millis(ms));
        }
        loader
    }
}
