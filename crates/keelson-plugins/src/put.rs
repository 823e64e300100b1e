//! PUT request handlers registered by plugins
//!
//! A plugin holding `putHandlers` claims a `(context, path)` pair with
//! `sk_register_put_handler`. A PUT for that pair calls the module export
//! `handle_put_<context>_<path>` (dots replaced by underscores) with the
//! JSON value and answers with the action result JSON the module returns.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::PluginError;
use crate::host::{PluginHost, PluginStatus, lock};

/// Module export serving PUT requests for `context` and `path`
pub fn put_handler_export(context: &str, path: &str) -> String {
    format!("handle_put_{}_{}", context.replace('.', "_"), path.replace('.', "_"))
}

/// Final action result with the given status
pub fn completed(status_code: u16, message: impl Into<String>) -> Value {
    json!({
        "state": "COMPLETED",
        "statusCode": status_code,
        "message": message.into(),
    })
}

/// HTTP status carried by an action result, 200 when absent
pub fn status_code(result: &Value) -> u16 {
    result
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(200)
}

#[derive(Default)]
pub struct PutHandlerTable {
    handlers: Mutex<HashMap<(String, String), String>>,
}

impl PutHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(context, path)` for a plugin, replacing any earlier owner
    pub fn register(&self, plugin_id: &str, context: &str, path: &str) {
        let key = (context.to_string(), path.to_string());
        if let Some(previous) = lock(&self.handlers).insert(key, plugin_id.to_string()) {
            if previous != plugin_id {
                warn!(plugin_id, previous = %previous, context, path, "PUT handler taken over");
            }
        }
    }

    pub fn owner(&self, context: &str, path: &str) -> Option<String> {
        lock(&self.handlers)
            .get(&(context.to_string(), path.to_string()))
            .cloned()
    }

    pub fn paths_for(&self, plugin_id: &str) -> Vec<(String, String)> {
        let mut paths: Vec<(String, String)> = lock(&self.handlers)
            .iter()
            .filter(|(_, owner)| owner.as_str() == plugin_id)
            .map(|(key, _)| key.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn remove_plugin(&self, plugin_id: &str) {
        lock(&self.handlers).retain(|_, owner| owner != plugin_id);
    }

    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }
}

impl PluginHost {
    /// Serve a PUT for `context`/`path` through the plugin that claimed it.
    /// Always returns an action result; failures are `COMPLETED` with an
    /// error status.
    pub async fn handle_put(&self, context: &str, path: &str, value: &Value) -> Value {
        let services = &self.inner.services;
        let Some(plugin_id) = services.puts.owner(context, path) else {
            return completed(405, format!("PUT not supported for {path}"));
        };
        let instance = services.plugins.get(&plugin_id).and_then(|record| {
            let plugin = lock(&record);
            (plugin.status == PluginStatus::Running)
                .then(|| plugin.instance.clone())
                .flatten()
        });
        let Some(instance) = instance else {
            return completed(503, "Plugin not running");
        };

        let export = put_handler_export(context, path);
        let value_json = value.to_string();
        debug!(plugin_id = %plugin_id, context, path, handler = %export, "calling PUT handler");
        let handler = export.clone();
        let outcome = self
            .inner
            .deadline
            .run(move || instance.call_put_handler(&handler, &value_json))
            .await;

        match outcome {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(plugin_id = %plugin_id, handler = %export, error = %e, "PUT handler returned invalid JSON");
                completed(500, format!("Handler error: {e}"))
            }),
            Ok(None) => {
                warn!(plugin_id = %plugin_id, handler = %export, "PUT handler not exported");
                completed(501, "Handler not implemented")
            }
            Err(PluginError::HandlerTimeout(ms)) => {
                warn!(plugin_id = %plugin_id, handler = %export, timeout_ms = ms, "PUT handler timed out");
                completed(504, "Handler timeout")
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, handler = %export, error = %e, "PUT handler failed");
                completed(500, format!("Handler error: {e}"))
            }
        }
    }
}
