//! Manifest-declared capability set
//!
//! Capabilities are fixed when the package is registered and never change
//! for the lifetime of the plugin record. Every host function names the
//! [`HostCall`] category it belongs to and asks [`Capabilities::require`]
//! before doing anything.

use serde::{Deserialize, Serialize};

use crate::{PluginError, PluginResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageMode {
    #[default]
    #[serde(rename = "vfs-only")]
    VfsOnly,
    #[serde(rename = "none")]
    None,
}

fn default_true() -> bool {
    true
}

/// `wasmCapabilities` block of a plugin package.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub storage: StorageMode,
    #[serde(default = "default_true")]
    pub data_read: bool,
    #[serde(default = "default_true")]
    pub data_write: bool,
    #[serde(default)]
    pub serial_ports: bool,
    #[serde(default)]
    pub put_handlers: bool,
    #[serde(default)]
    pub http_endpoints: bool,
    #[serde(default)]
    pub resource_provider: bool,
    #[serde(default)]
    pub weather_provider: bool,
    #[serde(default)]
    pub radar_provider: bool,
    #[serde(default)]
    pub raw_sockets: bool,
    #[serde(default)]
    pub server_events: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            network: false,
            storage: StorageMode::VfsOnly,
            data_read: true,
            data_write: true,
            serial_ports: false,
            put_handlers: false,
            http_endpoints: false,
            resource_provider: false,
            weather_provider: false,
            radar_provider: false,
            raw_sockets: false,
            server_events: false,
        }
    }
}

/// Category of a host function exposed across the module boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Log,
    Status,
    EmitData,
    ReadData,
    PluginConfig,
    ServerEvents,
    ResourceProvider,
    WeatherProvider,
    RadarProvider,
    RawSockets,
    PutHandlers,
}

impl HostCall {
    /// Capability name as written in package.json
    pub fn capability_name(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Status => "status",
            Self::EmitData => "dataWrite",
            Self::ReadData => "dataRead",
            Self::PluginConfig => "storage",
            Self::ServerEvents => "serverEvents",
            Self::ResourceProvider => "resourceProvider",
            Self::WeatherProvider => "weatherProvider",
            Self::RadarProvider => "radarProvider",
            Self::RawSockets => "rawSockets",
            Self::PutHandlers => "putHandlers",
        }
    }
}

impl Capabilities {
    /// Whether this set grants the given host call category.
    /// Logging and status reporting are granted to every plugin.
    pub fn grants(&self, call: HostCall) -> bool {
        match call {
            HostCall::Log | HostCall::Status => true,
            HostCall::EmitData => self.data_write,
            HostCall::ReadData => self.data_read,
            HostCall::PluginConfig => self.storage != StorageMode::None,
            HostCall::ServerEvents => self.server_events,
            HostCall::ResourceProvider => self.resource_provider,
            HostCall::WeatherProvider => self.weather_provider,
            HostCall::RadarProvider => self.radar_provider,
            HostCall::RawSockets => self.raw_sockets,
            HostCall::PutHandlers => self.put_handlers,
        }
    }

    pub fn require(&self, plugin_id: &str, call: HostCall) -> PluginResult<()> {
        if self.grants(call) {
            Ok(())
        } else {
            Err(PluginError::CapabilityDenied {
                plugin_id: plugin_id.to_string(),
                capability: call.capability_name(),
            })
        }
    }

    /// Answer a capability query by package.json name
    pub fn has(&self, name: &str) -> bool {
        match name {
            "network" => self.network,
            "storage" => self.storage != StorageMode::None,
            "dataRead" => self.data_read,
            "dataWrite" => self.data_write,
            "serialPorts" => self.serial_ports,
            "putHandlers" => self.put_handlers,
            "httpEndpoints" => self.http_endpoints,
            "resourceProvider" => self.resource_provider,
            "weatherProvider" => self.weather_provider,
            "radarProvider" => self.radar_provider,
            "rawSockets" => self.raw_sockets,
            "serverEvents" => self.server_events,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_block() {
        let caps: Capabilities = serde_json::from_str("{}").expect("parse");
        assert_eq!(caps, Capabilities::default());
        assert!(caps.data_read);
        assert!(caps.data_write);
        assert!(!caps.network);
        assert!(!caps.server_events);
        assert_eq!(caps.storage, StorageMode::VfsOnly);
    }

    #[test]
    fn test_explicit_denials_and_storage_none() {
        let caps: Capabilities =
            serde_json::from_str(r#"{"dataWrite": false, "storage": "none", "rawSockets": true}"#)
                .expect("parse");
        assert!(!caps.grants(HostCall::EmitData));
        assert!(!caps.grants(HostCall::PluginConfig));
        assert!(caps.grants(HostCall::RawSockets));
        assert!(caps.grants(HostCall::Log));
    }

    #[test]
    fn test_require_produces_capability_denied() {
        let caps = Capabilities::default();
        let err = caps.require("_signalk_hello", HostCall::ServerEvents).unwrap_err();
        match err {
            PluginError::CapabilityDenied { capability, .. } => assert_eq!(capability, "serverEvents"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(caps.require("_signalk_hello", HostCall::ReadData).is_ok());
    }

    #[test]
    fn test_has_by_name() {
        let caps = Capabilities {
            network: true,
            ..Default::default()
        };
        assert!(caps.has("network"));
        assert!(!caps.has("rawSockets"));
        assert!(!caps.has("teleport"));
    }

    #[test]
    fn test_put_handlers_gate() {
        let caps: Capabilities = serde_json::from_str(r#"{"putHandlers": true}"#).expect("parse");
        assert!(caps.grants(HostCall::PutHandlers));
        let err = Capabilities::default()
            .require("autopilot", HostCall::PutHandlers)
            .unwrap_err();
        assert!(err.to_string().contains("putHandlers"));
    }
}
