//! Plugin host: the single owner of every plugin record and the shared
//! services the capability bridge reaches into.
//!
//! Lifecycle operations live in [`crate::lifecycle`], package registration
//! in [`crate::registry`], the config API in [`crate::plugin_config`] and
//! the HTTP bridge in [`crate::routes`]; all of them are methods on
//! [`PluginHost`].

use chrono::{DateTime, Utc};
use keelson_core::config::ServerConfig;
use keelson_core::model::{Delta, ServerEvent, SkVersion};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bridge::Bridge;
use crate::capabilities::Capabilities;
use crate::events::EventManager;
use crate::lifecycle::{RESTART_BACKOFF_FLOOR, Wiring};
use crate::routes::{HandlerDeadline, RouteTable};
use crate::runtime::{PluginInstance, WasmRuntime};
use crate::put::PutHandlerTable;
use crate::sockets::SocketManager;
use crate::tcp::TcpManager;
use crate::storage::{PluginConfigFile, PluginStorage};
use crate::subscriptions::DeltaSubscriptionManager;
use crate::{PluginError, PluginResult};

/// The server the plugins run inside
pub trait ServerApp: Send + Sync + 'static {
    /// Accept a delta produced by a plugin
    fn handle_message(&self, plugin_id: &str, delta: Delta, version: SkVersion);

    fn get_self_path(&self, path: &str) -> Option<Value>;

    fn get_path(&self, path: &str) -> Option<Value>;

    fn set_plugin_status(&self, _plugin_id: &str, _message: &str) {}

    fn set_plugin_error(&self, _plugin_id: &str, _message: &str) {}

    /// Forward an event a plugin emitted onto the server bus
    fn emit_event(&self, _event: &ServerEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Resource,
    Weather,
    Radar,
}

/// A server-side registry plugins can join as a data provider
pub trait ProviderRegistry: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Register `plugin_id` as provider for `name`; false if refused
    fn register(&self, plugin_id: &str, name: &str) -> bool;

    fn unregister_plugin(&self, plugin_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
    Error,
}

impl PluginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered plugin
pub struct WasmPlugin {
    pub id: String,
    pub name: String,
    pub package_name: String,
    pub version: String,
    pub location: PathBuf,
    pub wasm_path: PathBuf,
    pub vfs_root: PathBuf,
    pub capabilities: Capabilities,
    pub config: PluginConfigFile,
    pub schema: Value,
    pub status: PluginStatus,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub crash_count: u32,
    pub last_crash: Option<DateTime<Utc>>,
    /// Monotonic time of the last crash, for expiring the crash streak
    pub last_crash_at: Option<tokio::time::Instant>,
    pub restart_backoff: Duration,
    pub instance: Option<Arc<PluginInstance>>,
}

impl WasmPlugin {
    pub fn new(
        id: String,
        package_name: String,
        location: PathBuf,
        wasm_path: PathBuf,
        vfs_root: PathBuf,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            name: package_name.clone(),
            id,
            package_name,
            version: "0.0.0".to_string(),
            location,
            wasm_path,
            vfs_root,
            capabilities,
            config: PluginConfigFile::default(),
            schema: Value::Object(Default::default()),
            status: PluginStatus::Stopped,
            status_message: None,
            error_message: None,
            crash_count: 0,
            last_crash: None,
            last_crash_at: None,
            restart_backoff: RESTART_BACKOFF_FLOOR,
            instance: None,
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            package_name: self.package_name.clone(),
            version: self.version.clone(),
            enabled: self.config.enabled,
            enable_debug: self.config.enable_debug,
            status: self.status,
            status_message: self.status_message.clone(),
            error_message: self.error_message.clone(),
            crash_count: self.crash_count,
            last_crash: self.last_crash,
            loaded: self.instance.is_some(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Point-in-time view of a plugin record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub package_name: String,
    pub version: String,
    pub enabled: bool,
    pub enable_debug: bool,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub crash_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crash: Option<DateTime<Utc>>,
    pub loaded: bool,
    pub capabilities: Capabilities,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) type PluginRecord = Arc<Mutex<WasmPlugin>>;

#[derive(Default)]
pub(crate) struct PluginTable {
    records: Mutex<HashMap<String, PluginRecord>>,
}

impl PluginTable {
    pub(crate) fn get(&self, plugin_id: &str) -> Option<PluginRecord> {
        lock(&self.records).get(plugin_id).cloned()
    }

    pub(crate) fn contains(&self, plugin_id: &str) -> bool {
        lock(&self.records).contains_key(plugin_id)
    }

    pub(crate) fn insert(&self, plugin: WasmPlugin) -> PluginRecord {
        let record = Arc::new(Mutex::new(plugin));
        let id = lock(&record).id.clone();
        lock(&self.records).insert(id, record.clone());
        record
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.records).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn update(&self, plugin_id: &str, f: impl FnOnce(&mut WasmPlugin)) -> bool {
        match self.get(plugin_id) {
            Some(record) => {
                f(&mut lock(&record));
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) -> Vec<PluginRecord> {
        lock(&self.records).drain().map(|(_, r)| r).collect()
    }
}

/// State shared by the host and every plugin's bridge
pub struct HostServices {
    pub app: Arc<dyn ServerApp>,
    pub providers: Vec<Arc<dyn ProviderRegistry>>,
    pub storage: PluginStorage,
    pub events: EventManager,
    pub deltas: DeltaSubscriptionManager,
    pub sockets: SocketManager,
    pub tcp: TcpManager,
    pub puts: PutHandlerTable,
    pub(crate) plugins: PluginTable,
}

impl HostServices {
    pub fn new(
        app: Arc<dyn ServerApp>,
        providers: Vec<Arc<dyn ProviderRegistry>>,
        storage: PluginStorage,
    ) -> Self {
        Self {
            app,
            providers,
            storage,
            events: EventManager::new(),
            deltas: DeltaSubscriptionManager::new(),
            sockets: SocketManager::new(),
            tcp: TcpManager::new(),
            puts: PutHandlerTable::new(),
            plugins: PluginTable::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub config_root: PathBuf,
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
}

impl HostOptions {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            handler_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1000),
        }
    }

    pub fn from_server_config(config: &ServerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config_root: config.plugin_config_root()?,
            handler_timeout: Duration::from_secs(config.plugins.handler_timeout_secs),
            poll_interval: Duration::from_millis(config.plugins.poll_interval_ms),
        })
    }
}

/// Static assets of a webapp package, served at `/<package_name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebappMount {
    pub package_name: String,
    pub dir: PathBuf,
}

impl WebappMount {
    pub fn url_path(&self) -> String {
        format!("/{}", self.package_name)
    }
}

pub(crate) struct HostInner {
    pub(crate) options: HostOptions,
    pub(crate) services: Arc<HostServices>,
    pub(crate) runtime: WasmRuntime,
    pub(crate) restart_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub(crate) wiring: Mutex<HashMap<String, Wiring>>,
    pub(crate) network_start: tokio::sync::Mutex<()>,
    pub(crate) routes: RouteTable,
    pub(crate) webapps: Mutex<Vec<WebappMount>>,
    pub(crate) deadline: HandlerDeadline,
}

/// Cheaply cloneable handle to the plugin host
#[derive(Clone)]
pub struct PluginHost {
    pub(crate) inner: Arc<HostInner>,
}

impl PluginHost {
    pub fn new(
        options: HostOptions,
        app: Arc<dyn ServerApp>,
        providers: Vec<Arc<dyn ProviderRegistry>>,
    ) -> PluginResult<Self> {
        let storage = PluginStorage::new(options.config_root.clone());
        let runtime = WasmRuntime::new(providers.clone())?;
        let services = Arc::new(HostServices::new(app, providers, storage));
        let deadline = HandlerDeadline::new(options.handler_timeout);
        tracing::info!(
            config_root = %options.config_root.display(),
            handler_timeout_ms = options.handler_timeout.as_millis() as u64,
            "plugin host initialized"
        );
        Ok(Self {
            inner: Arc::new(HostInner {
                options,
                services,
                runtime,
                restart_timers: Mutex::new(HashMap::new()),
                wiring: Mutex::new(HashMap::new()),
                network_start: tokio::sync::Mutex::new(()),
                routes: RouteTable::new(),
                webapps: Mutex::new(Vec::new()),
                deadline,
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<HostInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<HostInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.inner.services
    }

    pub fn runtime(&self) -> &WasmRuntime {
        &self.inner.runtime
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub(crate) fn record(&self, plugin_id: &str) -> PluginResult<PluginRecord> {
        self.inner
            .services
            .plugins
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))
    }

    pub(crate) fn bridge_for(&self, plugin_id: &str, capabilities: Capabilities) -> Arc<Bridge> {
        Arc::new(Bridge::new(
            plugin_id,
            capabilities,
            Arc::downgrade(&self.inner.services),
        ))
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginSummary> {
        self.inner
            .services
            .plugins
            .get(plugin_id)
            .map(|record| lock(&record).summary())
    }

    pub fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.inner
            .services
            .plugins
            .get(plugin_id)
            .map(|record| lock(&record).status)
    }

    pub fn list(&self) -> Vec<PluginSummary> {
        self.inner
            .services
            .plugins
            .ids()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Fan a normalized delta out to subscribed plugins
    pub fn route_delta(&self, delta: &Delta) {
        self.inner.services.deltas.route(delta);
    }

    /// Fan a server event out to subscribed plugins
    pub fn route_event(&self, event: &ServerEvent) {
        self.inner.services.events.route(event);
    }

    pub fn webapps(&self) -> Vec<WebappMount> {
        lock(&self.inner.webapps).clone()
    }

    /// Handler results that arrived after their client had been answered
    pub fn late_responses(&self) -> u64 {
        self.inner.deadline.late_count().load(Ordering::Relaxed)
    }
}
