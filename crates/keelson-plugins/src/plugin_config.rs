//! Plugin info and configuration API

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::PluginResult;
use crate::host::{PluginHost, PluginStatus, lock};

/// Body of `POST /plugins/<id>/config`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub enable_debug: Option<bool>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

impl PluginHost {
    /// `GET /plugins/<id>`
    pub fn plugin_info(&self, plugin_id: &str) -> PluginResult<Value> {
        let record = self.record(plugin_id)?;
        let plugin = lock(&record);
        Ok(json!({
            "enabled": plugin.config.enabled,
            "enabledByDefault": false,
            "id": plugin.id,
            "name": plugin.name,
            "version": plugin.version,
        }))
    }

    /// `GET /plugins/<id>/config`: persisted values win over the record
    pub fn get_config(&self, plugin_id: &str) -> PluginResult<Value> {
        let record = self.record(plugin_id)?;
        let (current, schema) = {
            let plugin = lock(&record);
            (plugin.config.clone(), plugin.schema.clone())
        };
        let storage = &self.inner.services.storage;
        let persisted = if storage.config_exists(plugin_id) {
            storage.read_config(plugin_id)?
        } else {
            current
        };
        Ok(json!({
            "enabled": persisted.enabled,
            "enableDebug": persisted.enable_debug,
            "configuration": persisted.configuration.unwrap_or_else(|| json!({})),
            "schema": schema,
        }))
    }

    /// `POST /plugins/<id>/config`: persist, then start or stop on an
    /// enabled-flag change
    pub async fn update_config(&self, plugin_id: &str, update: ConfigUpdate) -> PluginResult<String> {
        let record = self.record(plugin_id)?;
        let (previous, status, loaded) = {
            let plugin = lock(&record);
            (plugin.config.clone(), plugin.status, plugin.instance.is_some())
        };

        let mut next = previous.clone();
        if let Some(enable_debug) = update.enable_debug {
            next.enable_debug = enable_debug;
        }
        let enabled_changed = update.enabled.is_some_and(|enabled| enabled != previous.enabled);
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        next.configuration = update
            .configuration
            .or(previous.configuration)
            .or_else(|| Some(json!({})));

        self.inner.services.storage.write_config(plugin_id, &next)?;
        lock(&record).config = next.clone();
        debug!(plugin_id, enabled = next.enabled, enable_debug = next.enable_debug, "saved plugin configuration");

        if status == PluginStatus::Running && next.enabled {
            // restart so the module sees the new configuration
            self.stop(plugin_id).await?;
            self.start(plugin_id).await?;
            self.inner.services.plugins.update(plugin_id, |plugin| {
                plugin.status_message = Some("Configuration updated".to_string());
            });
        } else if enabled_changed {
            if next.enabled && status != PluginStatus::Running {
                if !loaded {
                    info!(plugin_id, "plugin enabled, loading module");
                    self.load_instance(plugin_id).await?;
                }
                self.start(plugin_id).await?;
            } else if !next.enabled
                && matches!(
                    status,
                    PluginStatus::Running | PluginStatus::Starting | PluginStatus::Crashed
                )
            {
                info!(plugin_id, "plugin disabled, stopping");
                self.stop(plugin_id).await?;
            }
        }

        Ok(format!("Saved configuration for plugin {plugin_id}"))
    }
}
