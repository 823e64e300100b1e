//! Keelson Plugin Host
//!
//! Runs untrusted WASM plugin modules inside a capability-gated sandbox:
//! - Binary format detection and module loading via wasmtime
//! - Capability bridge exposing narrow host functions to each module
//! - Per-plugin lifecycle with crash backoff and hot-reload buffering
//! - Event and delta fan-out to subscribed plugins
//! - HTTP route bridge with a client-facing handler deadline
//! - PUT handlers, UDP and TCP sockets owned by plugins

pub mod bridge;
pub mod capabilities;
pub mod events;
pub mod format;
pub mod host;
pub mod lifecycle;
pub mod manifest;
pub mod memory;
pub mod plugin_config;
pub mod put;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod sockets;
pub mod storage;
pub mod subscriptions;
pub mod tcp;

#[cfg(test)]
pub(crate) mod test_guest;

pub use capabilities::{Capabilities, HostCall, StorageMode};
pub use host::{HostOptions, PluginHost, PluginStatus, PluginSummary, ProviderKind, ProviderRegistry, ServerApp};
pub use registry::RegisterMode;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Unsupported binary format: {0}")]
    UnsupportedFormat(String),

    #[error("Capability '{capability}' not granted to plugin {plugin_id}")]
    CapabilityDenied {
        plugin_id: String,
        capability: &'static str,
    },

    #[error("{0}")]
    StartFailure(String),

    #[error("Reload failed: {0}")]
    ReloadFailure(String),

    #[error("Plugin crashed: {0}")]
    Crashed(String),

    #[error("Plugin handler timeout after {0} ms")]
    HandlerTimeout(u64),

    #[error("Plugin config IO error: {0}")]
    ConfigIo(String),

    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Plugin {0} is already loaded or loading")]
    AlreadyLoaded(String),

    #[error("Plugin {0} is not loaded")]
    NotLoaded(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin module does not export '{0}'")]
    ExportMissing(String),

    #[error("Buffer too small: needed {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("WASM execution error: {0}")]
    Wasm(String),

    #[error("Plugin JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plugin IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] keelson_core::Error),
}

impl PluginError {
    /// Stable code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "P001",
            Self::CapabilityDenied { .. } => "P002",
            Self::StartFailure(_) => "P003",
            Self::ReloadFailure(_) => "P004",
            Self::Crashed(_) => "P005",
            Self::HandlerTimeout(_) => "P006",
            Self::ConfigIo(_) => "P007",
            Self::InvalidManifest(_) => "P100",
            Self::AlreadyLoaded(_) => "P101",
            Self::NotLoaded(_) => "P102",
            Self::NotFound(_) => "P103",
            Self::ExportMissing(_) => "P104",
            Self::BufferTooSmall { .. } => "P105",
            Self::Wasm(_) => "P200",
            Self::Json(_) => "P201",
            Self::Io(_) => "P202",
            Self::Core(_) => "P203",
        }
    }

    pub(crate) fn wasm(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Wasm(format!("{context}: {err}"))
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
