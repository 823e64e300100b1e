//! Capability bridge: the only path from module code into the host
//!
//! [`Bridge`] holds the typed, capability-checked operations for one plugin.
//! [`link_imports`] exposes them as `env` imports, decoding arguments out of
//! linear memory and encoding results as i32 status codes:
//! - `-1` capability denied or failed call
//! - `-2` output buffer too small (nothing written)
//! - `0` "nothing" for value lookups, success for commands

use keelson_core::model::{Delta, Notification, ServerEvent, SkVersion, Update};
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Extern, Linker, Memory, Module, StoreLimits, Val};
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::capabilities::{Capabilities, HostCall};
use crate::events::{PLUGIN_EVENT_PREFIX, allowed_event_types};
use crate::host::{HostServices, ProviderKind};
use crate::memory::{read_bytes, read_managed_string, read_utf8, write_bytes};
use crate::sockets::{Datagram, SocketFamily};
use crate::storage::PluginConfigFile;
use crate::{PluginError, PluginResult};

const DENIED: i32 = -1;
const TOO_SMALL: i32 = -2;

/// Bytes reserved for the NUL-terminated source address written by `sk_udp_recv`
const ADDR_OUT_BYTES: usize = 46;

/// Per-store data: the WASI context plus this plugin's bridge
pub struct HostState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) bridge: Arc<Bridge>,
    pub(crate) limits: StoreLimits,
}

pub struct Bridge {
    plugin_id: String,
    capabilities: Capabilities,
    services: Weak<HostServices>,
}

impl Bridge {
    pub fn new(plugin_id: &str, capabilities: Capabilities, services: Weak<HostServices>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            capabilities,
            services,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn require(&self, call: HostCall) -> PluginResult<Arc<HostServices>> {
        self.capabilities.require(&self.plugin_id, call)?;
        self.services
            .upgrade()
            .ok_or_else(|| PluginError::NotLoaded(self.plugin_id.clone()))
    }

    pub fn log(&self, message: &str) {
        debug!(target: "keelson::plugin", plugin_id = %self.plugin_id, "{message}");
    }

    pub fn set_status(&self, message: &str) -> PluginResult<()> {
        let services = self.require(HostCall::Status)?;
        info!(plugin_id = %self.plugin_id, status = message, "plugin status");
        services.plugins.update(&self.plugin_id, |p| {
            p.status_message = Some(message.to_string());
        });
        services.app.set_plugin_status(&self.plugin_id, message);
        Ok(())
    }

    pub fn set_error(&self, message: &str) -> PluginResult<()> {
        let services = self.require(HostCall::Status)?;
        warn!(plugin_id = %self.plugin_id, error = message, "plugin reported error");
        services.plugins.update(&self.plugin_id, |p| {
            p.error_message = Some(message.to_string());
        });
        services.app.set_plugin_error(&self.plugin_id, message);
        Ok(())
    }

    /// Forward a delta to the data model
    pub fn handle_message(&self, delta_json: &str, version: SkVersion) -> PluginResult<()> {
        let services = self.require(HostCall::EmitData)?;
        let delta = Delta::from_json(delta_json)?;
        debug!(plugin_id = %self.plugin_id, ?version, "plugin emitted delta");
        services.app.handle_message(&self.plugin_id, delta, version);
        Ok(())
    }

    pub fn publish_notification(&self, path: &str, value_json: &str) -> PluginResult<()> {
        let services = self.require(HostCall::EmitData)?;
        let notification: Notification = serde_json::from_str(value_json)?;
        let delta = notification.into_delta(path)?;
        debug!(plugin_id = %self.plugin_id, path, "plugin published notification");
        services
            .app
            .handle_message(&self.plugin_id, delta, SkVersion::V1);
        Ok(())
    }

    pub fn get_self_path(&self, path: &str) -> PluginResult<Option<Value>> {
        let services = self.require(HostCall::ReadData)?;
        Ok(services.app.get_self_path(path))
    }

    pub fn get_path(&self, path: &str) -> PluginResult<Option<Value>> {
        let services = self.require(HostCall::ReadData)?;
        Ok(services.app.get_path(path))
    }

    /// The stored `configuration` object, `{}` when unset
    pub fn read_config(&self) -> PluginResult<String> {
        let services = self.require(HostCall::PluginConfig)?;
        let config = services.storage.read_config(&self.plugin_id)?;
        let configuration = config
            .configuration
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(configuration.to_string())
    }

    /// Replace the stored `configuration`, keeping the enabled flags
    pub fn save_config(&self, config_json: &str) -> PluginResult<()> {
        let services = self.require(HostCall::PluginConfig)?;
        let configuration: Value = serde_json::from_str(config_json)?;
        let mut file = if services.storage.config_exists(&self.plugin_id) {
            services.storage.read_config(&self.plugin_id)?
        } else {
            PluginConfigFile {
                enabled: true,
                ..Default::default()
            }
        };
        file.configuration = Some(configuration.clone());
        services.storage.write_config(&self.plugin_id, &file)?;
        services.plugins.update(&self.plugin_id, |p| {
            p.config.configuration = Some(configuration);
        });
        Ok(())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.has(name)
    }

    /// Set the event filter; applies to a live subscription immediately
    /// and to the one wired after start otherwise
    pub fn subscribe_events(&self, filter_json: &str) -> PluginResult<Vec<String>> {
        let services = self.require(HostCall::ServerEvents)?;
        let event_types: Vec<String> = serde_json::from_str(filter_json)?;
        let filter = services.events.request_filter(&self.plugin_id, &event_types);
        services.events.update_filter(&self.plugin_id, &filter);
        Ok(filter)
    }

    pub fn emit_event(&self, event_type: &str, data_json: &str) -> PluginResult<ServerEvent> {
        let services = self.require(HostCall::ServerEvents)?;
        let data: Value = serde_json::from_str(data_json)?;
        let event_type = if event_type.starts_with(PLUGIN_EVENT_PREFIX) {
            event_type.to_string()
        } else {
            format!("{PLUGIN_EVENT_PREFIX}{event_type}")
        };
        let event = ServerEvent::new(event_type, data).with_from(&self.plugin_id);
        debug!(plugin_id = %self.plugin_id, event_type = %event.event_type, "plugin emitted event");
        services.app.emit_event(&event);
        services.events.route(&event);
        Ok(event)
    }

    pub fn allowed_event_types(&self) -> PluginResult<String> {
        self.require(HostCall::ServerEvents)?;
        Ok(serde_json::to_string(&allowed_event_types())?)
    }

    pub fn register_provider(&self, kind: ProviderKind, name: &str) -> PluginResult<bool> {
        let call = match kind {
            ProviderKind::Resource => HostCall::ResourceProvider,
            ProviderKind::Weather => HostCall::WeatherProvider,
            ProviderKind::Radar => HostCall::RadarProvider,
        };
        let services = self.require(call)?;
        let registered = services
            .providers
            .iter()
            .filter(|r| r.kind() == kind)
            .fold(false, |any, r| r.register(&self.plugin_id, name) || any);
        info!(plugin_id = %self.plugin_id, ?kind, name, registered, "provider registration");
        Ok(registered)
    }

    pub fn udp_create(&self, family: SocketFamily) -> PluginResult<i32> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.sockets.create(&self.plugin_id, family))
    }

    pub fn udp_bind(&self, socket_id: i32, port: u16) -> PluginResult<SocketAddr> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.sockets.bind(&self.plugin_id, socket_id, port)?)
    }

    pub fn udp_multicast(
        &self,
        socket_id: i32,
        group: &str,
        interface: Option<&str>,
        join: bool,
    ) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        let group: IpAddr = parse_addr(group)?;
        let interface: Option<Ipv4Addr> = interface.map(parse_addr).transpose()?;
        if join {
            services
                .sockets
                .join_multicast(&self.plugin_id, socket_id, group, interface)?;
        } else {
            services
                .sockets
                .leave_multicast(&self.plugin_id, socket_id, group, interface)?;
        }
        Ok(())
    }

    pub fn udp_set_broadcast(&self, socket_id: i32, enabled: bool) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services
            .sockets
            .set_broadcast(&self.plugin_id, socket_id, enabled)?)
    }

    pub fn udp_send(&self, socket_id: i32, address: &str, port: u16, data: &[u8]) -> PluginResult<usize> {
        let services = self.require(HostCall::RawSockets)?;
        let to = SocketAddr::new(parse_addr(address)?, port);
        Ok(services.sockets.send(&self.plugin_id, socket_id, to, data)?)
    }

    pub fn udp_recv(&self, socket_id: i32) -> PluginResult<Option<Datagram>> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.sockets.recv(&self.plugin_id, socket_id)?)
    }

    pub fn udp_pending(&self, socket_id: i32) -> PluginResult<usize> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.sockets.pending(&self.plugin_id, socket_id)?)
    }

    pub fn udp_close(&self, socket_id: i32) -> PluginResult<bool> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.sockets.close(&self.plugin_id, socket_id))
    }

    pub fn udp_set_multicast_ttl(&self, socket_id: i32, ttl: u32) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services
            .sockets
            .set_multicast_ttl(&self.plugin_id, socket_id, ttl)?)
    }

    pub fn udp_set_multicast_loopback(&self, socket_id: i32, enabled: bool) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services
            .sockets
            .set_multicast_loopback(&self.plugin_id, socket_id, enabled)?)
    }

    pub fn tcp_create(&self) -> PluginResult<i32> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.create(&self.plugin_id))
    }

    pub fn tcp_connect(&self, socket_id: i32, host: &str, port: u16) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.connect(&self.plugin_id, socket_id, host.trim(), port)?)
    }

    pub fn tcp_connected(&self, socket_id: i32) -> PluginResult<bool> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.is_connected(&self.plugin_id, socket_id)?)
    }

    pub fn tcp_set_line_buffering(&self, socket_id: i32, line_mode: bool) -> PluginResult<()> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services
            .tcp
            .set_line_buffering(&self.plugin_id, socket_id, line_mode)?)
    }

    pub fn tcp_send(&self, socket_id: i32, data: &[u8]) -> PluginResult<usize> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.send(&self.plugin_id, socket_id, data)?)
    }

    pub fn tcp_recv_line(&self, socket_id: i32) -> PluginResult<Option<String>> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.recv_line(&self.plugin_id, socket_id)?)
    }

    pub fn tcp_recv_raw(&self, socket_id: i32) -> PluginResult<Option<Vec<u8>>> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.recv_raw(&self.plugin_id, socket_id)?)
    }

    pub fn tcp_pending(&self, socket_id: i32) -> PluginResult<usize> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.pending(&self.plugin_id, socket_id)?)
    }

    pub fn tcp_close(&self, socket_id: i32) -> PluginResult<bool> {
        let services = self.require(HostCall::RawSockets)?;
        Ok(services.tcp.close(&self.plugin_id, socket_id))
    }

    /// Claim PUT requests for `context`/`path` and advertise `supportsPut`
    /// for the path in the data model meta
    pub fn register_put_handler(&self, context: &str, path: &str) -> PluginResult<()> {
        let services = self.require(HostCall::PutHandlers)?;
        let meta = Delta {
            context: Some(context.to_string()),
            updates: vec![Update {
                meta: Some(vec![json!({"path": path, "value": {"supportsPut": true}})]),
                ..Default::default()
            }],
            ..Default::default()
        };
        services.app.handle_message(&self.plugin_id, meta, SkVersion::V1);
        services.puts.register(&self.plugin_id, context, path);
        info!(plugin_id = %self.plugin_id, context, path, "registered PUT handler");
        Ok(())
    }
}

fn parse_addr<T: std::str::FromStr>(text: &str) -> PluginResult<T> {
    text.trim()
        .parse()
        .map_err(|_| PluginError::Wasm(format!("invalid address '{text}'")))
}

/// Host functions importable from module `env`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFn {
    Debug,
    SetStatus,
    SetError,
    HandleMessage,
    PublishNotification,
    GetSelfPath,
    GetPath,
    ReadConfig,
    SaveConfig,
    HasCapability,
    SubscribeEvents,
    EmitEvent,
    GetAllowedEventTypes,
    RegisterProvider(ProviderKind),
    UdpCreate,
    UdpBind,
    UdpJoinMulticast,
    UdpLeaveMulticast,
    UdpSetBroadcast,
    UdpSend,
    UdpRecv,
    UdpPending,
    UdpClose,
    UdpSetMulticastTtl,
    UdpSetMulticastLoopback,
    TcpCreate,
    TcpConnect,
    TcpConnected,
    TcpSetLineBuffering,
    TcpSend,
    TcpRecvLine,
    TcpRecvRaw,
    TcpPending,
    TcpClose,
    RegisterPutHandler,
    Abort,
    Seed,
}

impl HostFn {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "sk_debug" => Self::Debug,
            "sk_set_status" => Self::SetStatus,
            "sk_set_error" => Self::SetError,
            "sk_handle_message" => Self::HandleMessage,
            "sk_publish_notification" => Self::PublishNotification,
            "sk_get_self_path" => Self::GetSelfPath,
            "sk_get_path" => Self::GetPath,
            "sk_read_config" => Self::ReadConfig,
            "sk_save_config" => Self::SaveConfig,
            "sk_has_capability" => Self::HasCapability,
            "sk_subscribe_events" => Self::SubscribeEvents,
            "sk_emit_event" => Self::EmitEvent,
            "sk_get_allowed_event_types" => Self::GetAllowedEventTypes,
            "sk_register_resource_provider" => Self::RegisterProvider(ProviderKind::Resource),
            "sk_register_weather_provider" => Self::RegisterProvider(ProviderKind::Weather),
            "sk_register_radar_provider" => Self::RegisterProvider(ProviderKind::Radar),
            "sk_udp_create" => Self::UdpCreate,
            "sk_udp_bind" => Self::UdpBind,
            "sk_udp_join_multicast" => Self::UdpJoinMulticast,
            "sk_udp_leave_multicast" => Self::UdpLeaveMulticast,
            "sk_udp_set_broadcast" => Self::UdpSetBroadcast,
            "sk_udp_send" => Self::UdpSend,
            "sk_udp_recv" => Self::UdpRecv,
            "sk_udp_pending" => Self::UdpPending,
            "sk_udp_close" => Self::UdpClose,
            "sk_udp_set_multicast_ttl" => Self::UdpSetMulticastTtl,
            "sk_udp_set_multicast_loopback" => Self::UdpSetMulticastLoopback,
            "sk_tcp_create" => Self::TcpCreate,
            "sk_tcp_connect" => Self::TcpConnect,
            "sk_tcp_connected" => Self::TcpConnected,
            "sk_tcp_set_line_buffering" => Self::TcpSetLineBuffering,
            "sk_tcp_send" => Self::TcpSend,
            "sk_tcp_recv_line" => Self::TcpRecvLine,
            "sk_tcp_recv_raw" => Self::TcpRecvRaw,
            "sk_tcp_pending" => Self::TcpPending,
            "sk_tcp_close" => Self::TcpClose,
            "sk_register_put_handler" => Self::RegisterPutHandler,
            "abort" => Self::Abort,
            "seed" => Self::Seed,
            _ => return None,
        };
        Some(f)
    }
}

/// Link every `env` import the module declares that the bridge knows,
/// using the module's own declared signature. Anything left unresolved
/// (other than WASI, linked separately) traps when called.
pub fn link_imports(linker: &mut Linker<HostState>, module: &Module) -> PluginResult<()> {
    for import in module.imports() {
        if import.module() != "env" {
            continue;
        }
        let (Some(host_fn), Some(ty)) = (HostFn::from_name(import.name()), import.ty().func().cloned())
        else {
            continue;
        };
        linker
            .func_new("env", import.name(), ty, move |caller, params, results| {
                dispatch(host_fn, caller, params, results)
            })
            .map_err(|e| PluginError::wasm(import.name(), e))?;
    }
    linker
        .define_unknown_imports_as_traps(module)
        .map_err(|e| PluginError::wasm("unknown imports", e))?;
    Ok(())
}

fn arg(params: &[Val], index: usize) -> i32 {
    match params.get(index) {
        Some(Val::I32(v)) => *v,
        _ => 0,
    }
}

fn ret(results: &mut [Val], code: i32) {
    if let Some(slot) = results.first_mut() {
        *slot = Val::I32(code);
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("module does not export memory"))
}

fn text_arg(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let memory = guest_memory(caller)?;
    Ok(read_utf8(&memory, &*caller, ptr, len)?)
}

/// Write `bytes` to a guest buffer; returns bytes written or [`TOO_SMALL`]
fn write_out(
    caller: &mut Caller<'_, HostState>,
    plugin_id: &str,
    ptr: i32,
    capacity: i32,
    bytes: &[u8],
) -> wasmtime::Result<i32> {
    let memory = guest_memory(caller)?;
    let capacity = usize::try_from(capacity).unwrap_or(0);
    match write_bytes(&memory, &mut *caller, ptr, capacity, bytes) {
        Ok(n) => Ok(n as i32),
        Err(PluginError::BufferTooSmall { needed, capacity }) => {
            debug!(plugin_id, needed, capacity, "guest buffer too small");
            Ok(TOO_SMALL)
        }
        Err(e) => Err(e.into()),
    }
}

/// Map a bridge result to a status code, logging the failure
fn code_of<T>(plugin_id: &str, call: &str, result: PluginResult<T>, ok: impl FnOnce(T) -> i32) -> i32 {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            debug!(plugin_id, call, error = %e, "host call failed");
            DENIED
        }
    }
}

fn dispatch(
    host_fn: HostFn,
    mut caller: Caller<'_, HostState>,
    params: &[Val],
    results: &mut [Val],
) -> wasmtime::Result<()> {
    let bridge = caller.data().bridge.clone();
    let id = bridge.plugin_id();
    match host_fn {
        HostFn::Debug => {
            let message = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            bridge.log(&message);
        }
        HostFn::SetStatus => {
            let message = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let code = code_of(id, "sk_set_status", bridge.set_status(&message), |_| 0);
            ret(results, code);
        }
        HostFn::SetError => {
            let message = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let code = code_of(id, "sk_set_error", bridge.set_error(&message), |_| 0);
            ret(results, code);
        }
        HostFn::HandleMessage => {
            let json = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let version = if params.len() > 2 {
                SkVersion::from_abi(arg(params, 2))
            } else {
                SkVersion::V1
            };
            let result = bridge.handle_message(&json, version);
            if let Err(PluginError::CapabilityDenied { .. }) = &result {
                warn!(plugin_id = id, "delta dropped: dataWrite not granted");
            }
            ret(results, code_of(id, "sk_handle_message", result, |_| 0));
        }
        HostFn::PublishNotification => {
            let path = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let value = text_arg(&mut caller, arg(params, 2), arg(params, 3))?;
            let result = bridge.publish_notification(&path, &value);
            ret(results, code_of(id, "sk_publish_notification", result, |_| 0));
        }
        HostFn::GetSelfPath | HostFn::GetPath => {
            let path = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let lookup = if host_fn == HostFn::GetSelfPath {
                bridge.get_self_path(&path)
            } else {
                bridge.get_path(&path)
            };
            let code = match lookup {
                Ok(Some(value)) => {
                    let bytes = value.to_string().into_bytes();
                    write_out(&mut caller, id, arg(params, 2), arg(params, 3), &bytes)?
                }
                Ok(None) => 0,
                Err(e) => code_of::<()>(id, "sk_get_path", Err(e), |_| 0),
            };
            ret(results, code);
        }
        HostFn::ReadConfig => {
            let code = match bridge.read_config() {
                Ok(json) => write_out(&mut caller, id, arg(params, 0), arg(params, 1), json.as_bytes())?,
                Err(e) => code_of::<()>(id, "sk_read_config", Err(e), |_| 0),
            };
            ret(results, code);
        }
        HostFn::SaveConfig => {
            let json = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            ret(results, code_of(id, "sk_save_config", bridge.save_config(&json), |_| 0));
        }
        HostFn::HasCapability => {
            let name = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            ret(results, i32::from(bridge.has_capability(&name)));
        }
        HostFn::SubscribeEvents => {
            let json = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let result = bridge.subscribe_events(&json);
            ret(results, i32::from(result.is_ok()));
            code_of(id, "sk_subscribe_events", result, |_| 1);
        }
        HostFn::EmitEvent => {
            let event_type = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let data = text_arg(&mut caller, arg(params, 2), arg(params, 3))?;
            let result = bridge.emit_event(&event_type, &data);
            ret(results, i32::from(result.is_ok()));
            code_of(id, "sk_emit_event", result, |_| 1);
        }
        HostFn::GetAllowedEventTypes => {
            let code = match bridge.allowed_event_types() {
                Ok(json) => write_out(&mut caller, id, arg(params, 0), arg(params, 1), json.as_bytes())?,
                Err(e) => code_of::<()>(id, "sk_get_allowed_event_types", Err(e), |_| 0),
            };
            ret(results, code);
        }
        HostFn::RegisterProvider(kind) => {
            let name = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let result = bridge.register_provider(kind, &name);
            let code = code_of(id, "sk_register_provider", result, i32::from);
            ret(results, code.max(0));
        }
        HostFn::UdpCreate => {
            let family = SocketFamily::from_abi(arg(params, 0));
            ret(results, code_of(id, "sk_udp_create", bridge.udp_create(family), |sid| sid));
        }
        HostFn::UdpBind => {
            let port = u16::try_from(arg(params, 1)).unwrap_or(0);
            let result = bridge.udp_bind(arg(params, 0), port);
            ret(results, code_of(id, "sk_udp_bind", result, |_| 0));
        }
        HostFn::UdpJoinMulticast | HostFn::UdpLeaveMulticast => {
            let group = text_arg(&mut caller, arg(params, 1), arg(params, 2))?;
            let interface = if arg(params, 4) > 0 {
                Some(text_arg(&mut caller, arg(params, 3), arg(params, 4))?)
            } else {
                None
            };
            let join = host_fn == HostFn::UdpJoinMulticast;
            let result = bridge.udp_multicast(arg(params, 0), &group, interface.as_deref(), join);
            ret(results, code_of(id, "sk_udp_multicast", result, |_| 0));
        }
        HostFn::UdpSetBroadcast => {
            let result = bridge.udp_set_broadcast(arg(params, 0), arg(params, 1) != 0);
            ret(results, code_of(id, "sk_udp_set_broadcast", result, |_| 0));
        }
        HostFn::UdpSend => {
            let address = text_arg(&mut caller, arg(params, 1), arg(params, 2))?;
            let port = u16::try_from(arg(params, 3)).unwrap_or(0);
            let memory = guest_memory(&mut caller)?;
            let data = read_bytes(&memory, &caller, arg(params, 4), arg(params, 5))?;
            let result = bridge.udp_send(arg(params, 0), &address, port, &data);
            ret(results, code_of(id, "sk_udp_send", result, |n| n as i32));
        }
        HostFn::UdpRecv => {
            let code = match bridge.udp_recv(arg(params, 0)) {
                Ok(Some(datagram)) => write_datagram(&mut caller, id, params, &datagram)?,
                Ok(None) => 0,
                Err(e) => code_of::<()>(id, "sk_udp_recv", Err(e), |_| 0),
            };
            ret(results, code);
        }
        HostFn::UdpPending => {
            let result = bridge.udp_pending(arg(params, 0));
            ret(results, code_of(id, "sk_udp_pending", result, |n| n as i32));
        }
        HostFn::UdpClose => {
            code_of(id, "sk_udp_close", bridge.udp_close(arg(params, 0)), |_| 0);
        }
        HostFn::UdpSetMulticastTtl => {
            let ttl = u32::try_from(arg(params, 1)).unwrap_or(1);
            let result = bridge.udp_set_multicast_ttl(arg(params, 0), ttl);
            ret(results, code_of(id, "sk_udp_set_multicast_ttl", result, |_| 0));
        }
        HostFn::UdpSetMulticastLoopback => {
            let result = bridge.udp_set_multicast_loopback(arg(params, 0), arg(params, 1) != 0);
            ret(results, code_of(id, "sk_udp_set_multicast_loopback", result, |_| 0));
        }
        HostFn::TcpCreate => {
            ret(results, code_of(id, "sk_tcp_create", bridge.tcp_create(), |sid| sid));
        }
        HostFn::TcpConnect => {
            let host = text_arg(&mut caller, arg(params, 1), arg(params, 2))?;
            let port = u16::try_from(arg(params, 3)).unwrap_or(0);
            let result = bridge.tcp_connect(arg(params, 0), &host, port);
            ret(results, code_of(id, "sk_tcp_connect", result, |_| 0));
        }
        HostFn::TcpConnected => {
            let result = bridge.tcp_connected(arg(params, 0));
            ret(results, code_of(id, "sk_tcp_connected", result, i32::from));
        }
        HostFn::TcpSetLineBuffering => {
            let result = bridge.tcp_set_line_buffering(arg(params, 0), arg(params, 1) != 0);
            ret(results, code_of(id, "sk_tcp_set_line_buffering", result, |_| 0));
        }
        HostFn::TcpSend => {
            let memory = guest_memory(&mut caller)?;
            let data = read_bytes(&memory, &caller, arg(params, 1), arg(params, 2))?;
            let result = bridge.tcp_send(arg(params, 0), &data);
            ret(results, code_of(id, "sk_tcp_send", result, |n| n as i32));
        }
        HostFn::TcpRecvLine | HostFn::TcpRecvRaw => {
            let received = if host_fn == HostFn::TcpRecvLine {
                bridge.tcp_recv_line(arg(params, 0)).map(|line| line.map(String::into_bytes))
            } else {
                bridge.tcp_recv_raw(arg(params, 0))
            };
            let code = match received {
                Ok(Some(bytes)) => write_out(&mut caller, id, arg(params, 1), arg(params, 2), &bytes)?,
                Ok(None) => 0,
                Err(e) => code_of::<()>(id, "sk_tcp_recv", Err(e), |_| 0),
            };
            ret(results, code);
        }
        HostFn::TcpPending => {
            let result = bridge.tcp_pending(arg(params, 0));
            ret(results, code_of(id, "sk_tcp_pending", result, |n| n as i32));
        }
        HostFn::TcpClose => {
            code_of(id, "sk_tcp_close", bridge.tcp_close(arg(params, 0)), |_| 0);
        }
        HostFn::RegisterPutHandler => {
            let context = text_arg(&mut caller, arg(params, 0), arg(params, 1))?;
            let path = text_arg(&mut caller, arg(params, 2), arg(params, 3))?;
            let result = bridge.register_put_handler(&context, &path);
            ret(results, code_of(id, "sk_register_put_handler", result, |_| 1).max(0));
        }
        HostFn::Abort => {
            let memory = guest_memory(&mut caller)?;
            let message = read_managed_string(&memory, &caller, arg(params, 0)).unwrap_or_default();
            let file = read_managed_string(&memory, &caller, arg(params, 1)).unwrap_or_default();
            return Err(wasmtime::Error::msg(format!(
                "abort: {message} at {file}:{}:{}",
                arg(params, 2),
                arg(params, 3)
            )));
        }
        HostFn::Seed => {
            let seed = chrono::Utc::now().timestamp_millis() as f64;
            if let Some(slot) = results.first_mut() {
                *slot = Val::F64(seed.to_bits());
            }
        }
    }
    Ok(())
}

/// `sk_udp_recv(socket, buf, max, addr_out, port_out)`. A datagram larger
/// than the buffer is dropped and reported as [`TOO_SMALL`].
fn write_datagram(
    caller: &mut Caller<'_, HostState>,
    plugin_id: &str,
    params: &[Val],
    datagram: &Datagram,
) -> wasmtime::Result<i32> {
    let written = write_out(caller, plugin_id, arg(params, 1), arg(params, 2), &datagram.data)?;
    if written < 0 {
        return Ok(written);
    }
    let memory = guest_memory(caller)?;
    let mut addr = datagram.from.ip().to_string().into_bytes();
    addr.push(0);
    write_bytes(&memory, &mut *caller, arg(params, 3), ADDR_OUT_BYTES, &addr)?;
    write_bytes(
        &memory,
        &mut *caller,
        arg(params, 4),
        2,
        &datagram.from.port().to_le_bytes(),
    )?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ServerApp;
    use crate::storage::PluginStorage;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingApp {
        deltas: Mutex<Vec<(String, Delta, SkVersion)>>,
        events: Mutex<Vec<ServerEvent>>,
    }

    impl ServerApp for RecordingApp {
        fn handle_message(&self, plugin_id: &str, delta: Delta, version: SkVersion) {
            self.deltas
                .lock()
                .expect("lock")
                .push((plugin_id.to_string(), delta, version));
        }

        fn get_self_path(&self, path: &str) -> Option<Value> {
            (path == "navigation.speedOverGround").then(|| json!(3.85))
        }

        fn get_path(&self, _path: &str) -> Option<Value> {
            None
        }

        fn emit_event(&self, event: &ServerEvent) {
            self.events.lock().expect("lock").push(event.clone());
        }
    }

    fn services(dir: &TempDir) -> (Arc<RecordingApp>, Arc<HostServices>) {
        let app = Arc::new(RecordingApp::default());
        let services = Arc::new(HostServices::new(
            app.clone(),
            Vec::new(),
            PluginStorage::new(dir.path()),
        ));
        (app, services)
    }

    const DELTA: &str = r#"{"updates":[{"values":[{"path":"navigation.speedOverGround","value":3.2}]}]}"#;

    #[test]
    fn test_delta_without_data_write_never_reaches_server() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let caps = Capabilities {
            data_write: false,
            ..Default::default()
        };
        let bridge = Bridge::new("readonly", caps, Arc::downgrade(&services));

        let err = bridge.handle_message(DELTA, SkVersion::V1).unwrap_err();
        assert!(matches!(err, PluginError::CapabilityDenied { capability: "dataWrite", .. }));
        assert!(app.deltas.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_delta_forwarded_with_version() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let bridge = Bridge::new("writer", Capabilities::default(), Arc::downgrade(&services));

        bridge.handle_message(DELTA, SkVersion::V2).expect("forward");
        let deltas = app.deltas.lock().expect("lock");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].0, "writer");
        assert_eq!(deltas[0].2, SkVersion::V2);
    }

    #[test]
    fn test_notification_state_is_validated() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let bridge = Bridge::new("anchor", Capabilities::default(), Arc::downgrade(&services));

        assert!(
            bridge
                .publish_notification("anchor.drag", r#"{"state":"panic","message":"x"}"#)
                .is_err()
        );
        bridge
            .publish_notification(
                "anchor.drag",
                r#"{"state":"alarm","method":["sound"],"message":"Anchor dragging"}"#,
            )
            .expect("publish");
        let deltas = app.deltas.lock().expect("lock");
        assert_eq!(deltas.len(), 1);
        assert_eq!(
            deltas[0].1.paths().collect::<Vec<_>>(),
            vec!["notifications.anchor.drag"]
        );
    }

    #[test]
    fn test_data_read_gates_path_lookup() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let open = Bridge::new("reader", Capabilities::default(), Arc::downgrade(&services));
        assert_eq!(
            open.get_self_path("navigation.speedOverGround").expect("read"),
            Some(json!(3.85))
        );

        let closed = Bridge::new(
            "blind",
            Capabilities {
                data_read: false,
                ..Default::default()
            },
            Arc::downgrade(&services),
        );
        assert!(closed.get_self_path("navigation.speedOverGround").is_err());
    }

    #[test]
    fn test_save_config_preserves_flags() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        services
            .storage
            .write_config(
                "logger",
                &PluginConfigFile {
                    enabled: true,
                    enable_debug: true,
                    configuration: None,
                },
            )
            .expect("seed");
        let bridge = Bridge::new("logger", Capabilities::default(), Arc::downgrade(&services));

        assert_eq!(bridge.read_config().expect("read"), "{}");
        bridge.save_config(r#"{"interval":5}"#).expect("save");
        let stored = services.storage.read_config("logger").expect("stored");
        assert!(stored.enabled);
        assert!(stored.enable_debug);
        assert_eq!(stored.configuration, Some(json!({"interval": 5})));
        assert_eq!(bridge.read_config().expect("read"), r#"{"interval":5}"#);
    }

    #[test]
    fn test_storage_none_denies_config_access() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let caps: Capabilities = serde_json::from_str(r#"{"storage":"none"}"#).expect("caps");
        let bridge = Bridge::new("stateless", caps, Arc::downgrade(&services));
        assert!(bridge.read_config().is_err());
        assert!(bridge.save_config("{}").is_err());
    }

    #[test]
    fn test_emitted_events_are_prefixed_and_attributed() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let caps = Capabilities {
            server_events: true,
            ..Default::default()
        };
        let bridge = Bridge::new("ais", caps, Arc::downgrade(&services));

        let event = bridge.emit_event("TARGET_LOST", r#"{"mmsi":1}"#).expect("emit");
        assert_eq!(event.event_type, "PLUGIN_TARGET_LOST");
        assert_eq!(event.from.as_deref(), Some("ais"));
        let again = bridge.emit_event("PLUGIN_X", "{}").expect("emit");
        assert_eq!(again.event_type, "PLUGIN_X");
        assert_eq!(app.events.lock().expect("lock").len(), 2);
    }

    #[test]
    fn test_events_require_server_events_capability() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let bridge = Bridge::new("quiet", Capabilities::default(), Arc::downgrade(&services));
        assert!(bridge.emit_event("X", "{}").is_err());
        assert!(bridge.subscribe_events("[]").is_err());
        assert!(bridge.allowed_event_types().is_err());
        assert!(app.events.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_subscribe_events_records_filter() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let caps = Capabilities {
            server_events: true,
            ..Default::default()
        };
        let bridge = Bridge::new("stats", caps, Arc::downgrade(&services));
        bridge
            .subscribe_events(r#"["SERVERSTATISTICS"]"#)
            .expect("subscribe");
        assert_eq!(
            services.events.requested_filter("stats"),
            vec!["SERVERSTATISTICS".to_string()]
        );
        assert!(bridge.subscribe_events("\"not an array\"").is_err());
    }

    #[test]
    fn test_raw_sockets_gate() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let bridge = Bridge::new("radar", Capabilities::default(), Arc::downgrade(&services));
        assert!(bridge.udp_create(SocketFamily::V4).is_err());
        assert_eq!(services.sockets.open_count("radar"), 0);
    }

    #[test]
    fn test_put_handler_requires_capability() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let bridge = Bridge::new("lights", Capabilities::default(), Arc::downgrade(&services));
        let err = bridge
            .register_put_handler("vessels.self", "electrical.switches.anchor.state")
            .unwrap_err();
        assert!(matches!(err, PluginError::CapabilityDenied { capability: "putHandlers", .. }));
        assert!(services.puts.owner("vessels.self", "electrical.switches.anchor.state").is_none());
        assert!(app.deltas.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_put_handler_advertises_supports_put() {
        let dir = TempDir::new().expect("tempdir");
        let (app, services) = services(&dir);
        let caps = Capabilities {
            put_handlers: true,
            ..Default::default()
        };
        let bridge = Bridge::new("lights", caps, Arc::downgrade(&services));
        bridge
            .register_put_handler("vessels.self", "electrical.switches.anchor.state")
            .expect("register");

        assert_eq!(
            services
                .puts
                .owner("vessels.self", "electrical.switches.anchor.state")
                .as_deref(),
            Some("lights")
        );
        let deltas = app.deltas.lock().expect("lock");
        assert_eq!(deltas.len(), 1);
        let (from, delta, _) = &deltas[0];
        assert_eq!(from, "lights");
        assert_eq!(delta.context.as_deref(), Some("vessels.self"));
        assert_eq!(
            delta.updates[0].meta,
            Some(vec![json!({
                "path": "electrical.switches.anchor.state",
                "value": {"supportsPut": true}
            })])
        );
    }

    #[test]
    fn test_tcp_and_multicast_options_share_raw_sockets_gate() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let denied = Bridge::new("nmea", Capabilities::default(), Arc::downgrade(&services));
        assert!(denied.tcp_create().is_err());
        assert!(denied.udp_set_multicast_ttl(1, 4).is_err());
        assert_eq!(services.tcp.open_count("nmea"), 0);

        let caps = Capabilities {
            raw_sockets: true,
            ..Default::default()
        };
        let granted = Bridge::new("nmea", caps, Arc::downgrade(&services));
        let tcp = granted.tcp_create().expect("create");
        assert!(!granted.tcp_connected(tcp).expect("state"));
        assert!(granted.tcp_send(tcp, b"$GPGGA\r\n").is_err());
        assert_eq!(granted.tcp_recv_line(tcp).expect("recv"), None);
        granted.tcp_set_line_buffering(tcp, false).expect("raw mode");
        assert_eq!(granted.tcp_pending(tcp).expect("pending"), 0);

        let udp = granted.udp_create(SocketFamily::V4).expect("udp");
        granted.udp_set_multicast_ttl(udp, 4).expect("ttl");
        granted.udp_set_multicast_loopback(udp, false).expect("loopback");

        assert!(granted.tcp_close(tcp).expect("close"));
        assert_eq!(services.tcp.open_count("nmea"), 0);
    }

    #[test]
    fn test_bridge_outliving_host_reports_not_loaded() {
        let dir = TempDir::new().expect("tempdir");
        let (_app, services) = services(&dir);
        let bridge = Bridge::new("orphan", Capabilities::default(), Arc::downgrade(&services));
        drop(services);
        assert!(matches!(bridge.set_status("hi"), Err(PluginError::NotLoaded(_))));
    }

    #[test]
    fn test_host_fn_names() {
        assert_eq!(HostFn::from_name("sk_debug"), Some(HostFn::Debug));
        assert_eq!(
            HostFn::from_name("sk_register_radar_provider"),
            Some(HostFn::RegisterProvider(ProviderKind::Radar))
        );
        assert_eq!(
            HostFn::from_name("sk_register_put_handler"),
            Some(HostFn::RegisterPutHandler)
        );
        assert_eq!(HostFn::from_name("sk_tcp_recv_line"), Some(HostFn::TcpRecvLine));
        assert_eq!(
            HostFn::from_name("sk_udp_set_multicast_ttl"),
            Some(HostFn::UdpSetMulticastTtl)
        );
        assert_eq!(HostFn::from_name("fetch"), None);
    }
}
