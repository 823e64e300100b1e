//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Keelson server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Root under which `plugin-config-data/` lives; defaults to the config dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_root: Option<PathBuf>,
    /// Directories scanned for plugin packages (each child holding a package.json)
    #[serde(default)]
    pub package_dirs: Vec<PathBuf>,
    pub handler_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            config_root: None,
            package_dirs: Vec::new(),
            handler_timeout_secs: 10,
            poll_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("KEELSON_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("keelson")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            debug!(path = %path.display(), "loaded server config");
            Ok(config)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(ServerConfig::default())
        }
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        debug!(path = %path.display(), "saved server config");

        Ok(())
    }

    /// Root directory holding per-plugin configuration and sandboxes
    pub fn plugin_config_root(&self) -> anyhow::Result<PathBuf> {
        match &self.plugins.config_root {
            Some(root) => Ok(root.clone()),
            None => Self::config_dir(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(anyhow!("server.host must not be empty"));
        }
        if self.plugins.handler_timeout_secs == 0 {
            return Err(anyhow!("plugins.handler_timeout_secs must be at least 1"));
        }
        if self.plugins.poll_interval_ms < 100 {
            return Err(anyhow!("plugins.poll_interval_ms must be at least 100"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "server.host" => Ok(self.server.host.clone()),
            "server.port" => Ok(self.server.port.to_string()),

            "plugins.config_root" => Ok(match &self.plugins.config_root {
                Some(root) => root.display().to_string(),
                None => "(default: config directory)".to_string(),
            }),
            "plugins.package_dirs" => Ok(self
                .plugins
                .package_dirs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")),
            "plugins.handler_timeout_secs" => Ok(self.plugins.handler_timeout_secs.to_string()),
            "plugins.poll_interval_ms" => Ok(self.plugins.poll_interval_ms.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `keelson config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "server.host" => {
                self.server.host = value.to_string();
            }
            "server.port" => {
                self.server.port = value
                    .parse()
                    .with_context(|| format!("Invalid port value: {}", value))?;
            }
            "plugins.config_root" => {
                self.plugins.config_root = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "plugins.package_dirs" => {
                self.plugins.package_dirs = value
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            "plugins.handler_timeout_secs" => {
                self.plugins.handler_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout value: {}", value))?;
            }
            "plugins.poll_interval_ms" => {
                self.plugins.poll_interval_ms = value
                    .parse()
                    .with_context(|| format!("Invalid poll interval: {}", value))?;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `keelson config show` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// All keys understood by `get`/`set`
    pub fn keys() -> &'static [&'static str] {
        &[
            "server.host",
            "server.port",
            "plugins.config_root",
            "plugins.package_dirs",
            "plugins.handler_timeout_secs",
            "plugins.poll_interval_ms",
        ]
    }
}

#[cfg(test)]
#[path = "../config_tests.rs"]
mod config_tests;
