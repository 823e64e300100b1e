//! Per-plugin on-disk storage
//!
//! Layout below `<configRoot>/plugin-config-data/`:
//! - `<pluginId>.json` holds `{enabled, enableDebug, configuration}` and is
//!   managed by the server, never visible inside the sandbox.
//! - `<sanitizedPackageName>/vfs/{data,config,tmp}` is the sandbox root.
//! - `.temp-<pluginId>/` is a scratch sandbox used while registering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::manifest::sanitize_package_name;
use crate::{PluginError, PluginResult};

const CONFIG_DATA_DIR: &str = "plugin-config-data";

/// Persisted plugin configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfigFile {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub enable_debug: bool,
    /// Absent until the operator configures the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
}

impl PluginConfigFile {
    /// JSON handed to the module's start export: configuration plus `enableDebug`
    pub fn start_payload(&self) -> Value {
        let mut payload = match &self.configuration {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert("enableDebug".to_string(), Value::Bool(self.enable_debug));
        Value::Object(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub config_file: PathBuf,
    pub vfs_root: PathBuf,
    pub vfs_data: PathBuf,
    pub vfs_config: PathBuf,
    pub vfs_tmp: PathBuf,
}

/// Storage manager rooted at the server's config directory
#[derive(Debug, Clone)]
pub struct PluginStorage {
    config_root: PathBuf,
}

impl PluginStorage {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    fn data_dir(&self) -> PathBuf {
        self.config_root.join(CONFIG_DATA_DIR)
    }

    pub fn paths(&self, plugin_id: &str, package_name: &str) -> StoragePaths {
        let vfs_root = self
            .data_dir()
            .join(sanitize_package_name(package_name))
            .join("vfs");
        StoragePaths {
            config_file: self.config_file(plugin_id),
            vfs_data: vfs_root.join("data"),
            vfs_config: vfs_root.join("config"),
            vfs_tmp: vfs_root.join("tmp"),
            vfs_root,
        }
    }

    pub fn config_file(&self, plugin_id: &str) -> PathBuf {
        self.data_dir().join(format!("{plugin_id}.json"))
    }

    pub fn temp_vfs_root(&self, plugin_id: &str) -> PathBuf {
        self.data_dir().join(format!(".temp-{plugin_id}"))
    }

    /// Create the sandbox directory tree and clear stale temp files
    pub fn init_vfs(&self, paths: &StoragePaths) -> PluginResult<()> {
        for dir in [&paths.vfs_root, &paths.vfs_data, &paths.vfs_config, &paths.vfs_tmp] {
            fs::create_dir_all(dir)?;
        }
        cleanup_tmp(&paths.vfs_tmp);
        debug!(vfs_root = %paths.vfs_root.display(), "initialized plugin VFS");
        Ok(())
    }

    pub fn remove_temp_vfs(&self, plugin_id: &str) {
        let temp = self.temp_vfs_root(plugin_id);
        if temp.exists() {
            if let Err(e) = fs::remove_dir_all(&temp) {
                warn!(path = %temp.display(), error = %e, "failed to remove temporary VFS");
            }
        }
    }

    /// Read the persisted config; a missing file yields `{enabled: false}`
    pub fn read_config(&self, plugin_id: &str) -> PluginResult<PluginConfigFile> {
        let path = self.config_file(plugin_id);
        if !path.exists() {
            debug!(plugin_id, "config file not found, using defaults");
            return Ok(PluginConfigFile::default());
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| PluginError::ConfigIo(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| PluginError::ConfigIo(format!("{}: {e}", path.display())))
    }

    pub fn write_config(&self, plugin_id: &str, config: &PluginConfigFile) -> PluginResult<()> {
        let path = self.config_file(plugin_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| PluginError::ConfigIo(format!("{}: {e}", dir.display())))?;
        }
        let text = serde_json::to_string_pretty(config)?;
        fs::write(&path, text)
            .map_err(|e| PluginError::ConfigIo(format!("{}: {e}", path.display())))?;
        debug!(plugin_id, path = %path.display(), "wrote plugin config");
        Ok(())
    }

    pub fn config_exists(&self, plugin_id: &str) -> bool {
        self.config_file(plugin_id).exists()
    }
}

fn cleanup_tmp(tmp: &Path) {
    let Ok(entries) = fs::read_dir(tmp) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "failed to delete temp file");
            }
        }
    }
}
