//! WASM runtime: module loading and typed entry points
//!
//! Exports are resolved once at load into [`Entry`] slots; the calling
//! convention of each slot is read from its signature:
//! - identity exports: `(out_ptr, max) -> written` or `() -> string_ptr`
//! - start and handlers: `(ptr, len)` raw UTF-8 or `(string_ptr)`
//! - HTTP handlers: `(req_ptr, req_len, resp_ptr, resp_max) -> written`
//!   or `(string_ptr, char_len) -> string_ptr`
//! - PUT handlers: `(value_ptr, value_len, resp_ptr, resp_max) -> written`
//!   or `(string_ptr) -> string_ptr`, looked up by name when called

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use tracing::{debug, info, warn};
use wasmtime::{
    Config, Engine, Func, Instance, Linker, Module, Store, StoreLimitsBuilder, Val,
    WasmBacktraceDetails,
};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::bridge::{Bridge, HostState, link_imports};
use crate::capabilities::Capabilities;
use crate::format::ensure_supported;
use crate::host::{ProviderRegistry, lock};
use crate::manifest::{MAX_MODULE_BYTES, load_wasm_bytes};
use crate::memory::{
    Abi, GuestMemory, HTTP_RESPONSE_BUFFER_BYTES, IDENTITY_BUFFER_BYTES, PUT_RESPONSE_BUFFER_BYTES, checked_len,
};
use crate::routes::EndpointSpec;
use crate::{PluginError, PluginResult};

/// Linear memory cap per plugin instance
pub const MAX_MEMORY_BYTES: usize = 256 * 1024 * 1024;

/// Module entry points known to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    Id,
    Name,
    Schema,
    Start,
    Stop,
    Poll,
    DeltaHandler,
    EventHandler,
    HttpEndpoints,
}

impl Entry {
    pub const ALL: [Entry; 9] = [
        Entry::Id,
        Entry::Name,
        Entry::Schema,
        Entry::Start,
        Entry::Stop,
        Entry::Poll,
        Entry::DeltaHandler,
        Entry::EventHandler,
        Entry::HttpEndpoints,
    ];

    pub fn export_name(self) -> &'static str {
        match self {
            Self::Id => "plugin_id",
            Self::Name => "plugin_name",
            Self::Schema => "plugin_schema",
            Self::Start => "plugin_start",
            Self::Stop => "plugin_stop",
            Self::Poll => "poll",
            Self::DeltaHandler => "delta_handler",
            Self::EventHandler => "event_handler",
            Self::HttpEndpoints => "http_endpoints",
        }
    }

    pub fn required(self) -> bool {
        matches!(self, Self::Name | Self::Start | Self::Stop)
    }
}

/// Everything needed to (re)load a plugin module
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub plugin_id: String,
    pub wasm_path: PathBuf,
    pub vfs_root: PathBuf,
    pub capabilities: Capabilities,
}

/// What the module reports about itself
#[derive(Debug, Clone, PartialEq)]
pub struct PluginIdentity {
    pub id: Option<String>,
    pub name: String,
    pub schema: Value,
}

struct LoadedModule {
    store: Store<HostState>,
    instance: Instance,
    guest: GuestMemory,
    funcs: HashMap<Entry, Func>,
    handlers: HashMap<String, Func>,
}

fn first_i32(results: &[Val]) -> Option<i32> {
    match results.first() {
        Some(Val::I32(v)) => Some(*v),
        _ => None,
    }
}

impl LoadedModule {
    fn func(&self, entry: Entry) -> PluginResult<Func> {
        self.funcs
            .get(&entry)
            .copied()
            .ok_or_else(|| PluginError::ExportMissing(entry.export_name().to_string()))
    }

    fn call(&mut self, name: &str, func: Func, args: &[Val]) -> PluginResult<Option<i32>> {
        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];
        func.call(&mut self.store, args, &mut results)
            .map_err(|e| PluginError::wasm(name, e))?;
        Ok(first_i32(&results))
    }

    /// Call an entry with one text argument in whichever form it declares
    fn call_with_text(&mut self, entry: Entry, text: &str) -> PluginResult<Option<i32>> {
        let func = self.func(entry)?;
        let name = entry.export_name();
        match func.ty(&self.store).params().len() {
            2 => {
                let alloc = self.guest.pass_bytes(&mut self.store, text.as_bytes())?;
                let out = self.call(name, func, &[Val::I32(alloc.ptr), Val::I32(alloc.len)]);
                self.guest.free(&mut self.store, alloc);
                out
            }
            1 => {
                let alloc = self.guest.new_managed_string(&mut self.store, text)?;
                let out = self.call(name, func, &[Val::I32(alloc.ptr)]);
                self.guest.free(&mut self.store, alloc);
                out
            }
            0 => self.call(name, func, &[]),
            n => Err(PluginError::Wasm(format!("{name}: unsupported signature ({n} params)"))),
        }
    }

    fn call_no_args(&mut self, entry: Entry) -> PluginResult<Option<i32>> {
        let func = self.func(entry)?;
        self.call(entry.export_name(), func, &[])
    }

    /// Read a string-returning export; `None` if the module lacks it
    fn read_string(&mut self, entry: Entry) -> PluginResult<Option<String>> {
        let Some(func) = self.funcs.get(&entry).copied() else {
            return Ok(None);
        };
        let name = entry.export_name();
        match func.ty(&self.store).params().len() {
            2 => {
                let buf = self.guest.alloc(&mut self.store, IDENTITY_BUFFER_BYTES)?;
                let written = self.call(name, func, &[Val::I32(buf.ptr), Val::I32(buf.len)]);
                let text = written
                    .and_then(|w| checked_len(w.unwrap_or(0), IDENTITY_BUFFER_BYTES))
                    .and_then(|n| self.guest.read_utf8(&self.store, buf.ptr, n));
                self.guest.free(&mut self.store, buf);
                text.map(Some)
            }
            0 => {
                let ptr = self.call(name, func, &[])?.unwrap_or(0);
                self.guest.read_managed(&self.store, ptr).map(Some)
            }
            n => Err(PluginError::Wasm(format!("{name}: unsupported signature ({n} params)"))),
        }
    }

    fn read_identity(&mut self, plugin_id: &str) -> PluginResult<PluginIdentity> {
        let id = self.read_string(Entry::Id)?.filter(|s| !s.is_empty());
        let name = self.read_string(Entry::Name)?.unwrap_or_default();
        let schema = match self.read_string(Entry::Schema)? {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(plugin_id, error = %e, "plugin schema is not valid JSON, using {{}}");
                Value::Object(Default::default())
            }),
            _ => Value::Object(Default::default()),
        };
        Ok(PluginIdentity { id, name, schema })
    }

    fn read_endpoints(&mut self, plugin_id: &str) -> Vec<EndpointSpec> {
        let text = match self.read_string(Entry::HttpEndpoints) {
            Ok(Some(text)) => text,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(plugin_id, error = %e, "failed to read http_endpoints");
                return Vec::new();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(plugin_id, error = %e, "http_endpoints is not a valid endpoint list");
            Vec::new()
        })
    }

    fn resolve_handlers(&mut self, plugin_id: &str, endpoints: &[EndpointSpec]) {
        for endpoint in endpoints {
            match self.instance.get_func(&mut self.store, &endpoint.handler) {
                Some(func) => {
                    self.handlers.insert(endpoint.handler.clone(), func);
                }
                None => warn!(
                    plugin_id,
                    handler = %endpoint.handler,
                    "endpoint handler declared but not exported"
                ),
            }
        }
    }

    /// `(in_ptr, in_len, out_ptr, out_max) -> written` with a host-sized
    /// output buffer
    fn call_buffered(&mut self, name: &str, func: Func, input: &str, capacity: usize) -> PluginResult<String> {
        let req = self.guest.pass_bytes(&mut self.store, input.as_bytes())?;
        let resp = match self.guest.alloc(&mut self.store, capacity) {
            Ok(resp) => resp,
            Err(e) => {
                self.guest.free(&mut self.store, req);
                return Err(e);
            }
        };
        let args = [
            Val::I32(req.ptr),
            Val::I32(req.len),
            Val::I32(resp.ptr),
            Val::I32(resp.len),
        ];
        let body = self
            .call(name, func, &args)
            .and_then(|w| checked_len(w.unwrap_or(0), capacity))
            .and_then(|n| self.guest.read_utf8(&self.store, resp.ptr, n));
        self.guest.free(&mut self.store, req);
        self.guest.free(&mut self.store, resp);
        body
    }

    fn call_put(&mut self, export: &str, value_json: &str) -> PluginResult<Option<String>> {
        let Some(func) = self.instance.get_func(&mut self.store, export) else {
            return Ok(None);
        };
        match func.ty(&self.store).params().len() {
            4 => self
                .call_buffered(export, func, value_json, PUT_RESPONSE_BUFFER_BYTES)
                .map(Some),
            1 if self.guest.abi() == Abi::Managed => {
                let value = self.guest.new_managed_string(&mut self.store, value_json)?;
                let out = self.call(export, func, &[Val::I32(value.ptr)]);
                self.guest.free(&mut self.store, value);
                let ptr = out?.unwrap_or(0);
                self.guest.read_managed(&self.store, ptr).map(Some)
            }
            n => Err(PluginError::Wasm(format!(
                "{export}: unsupported PUT handler signature ({n} params)"
            ))),
        }
    }

    fn call_handler(&mut self, handler: &str, ctx: &str) -> PluginResult<String> {
        let func = self
            .handlers
            .get(handler)
            .copied()
            .ok_or_else(|| PluginError::ExportMissing(handler.to_string()))?;
        match func.ty(&self.store).params().len() {
            4 => self.call_buffered(handler, func, ctx, HTTP_RESPONSE_BUFFER_BYTES),
            2 if self.guest.abi() == Abi::Managed => {
                let chars = i32::try_from(ctx.encode_utf16().count())
                    .map_err(|_| PluginError::Wasm("request too large".to_string()))?;
                let req = self.guest.new_managed_string(&mut self.store, ctx)?;
                let out = self.call(handler, func, &[Val::I32(req.ptr), Val::I32(chars)]);
                self.guest.free(&mut self.store, req);
                let ptr = out?.unwrap_or(0);
                self.guest.read_managed(&self.store, ptr)
            }
            n => Err(PluginError::Wasm(format!(
                "{handler}: unsupported handler signature ({n} params)"
            ))),
        }
    }
}

/// A live module instance
pub struct PluginInstance {
    plugin_id: String,
    spec: LoadSpec,
    bridge: Arc<Bridge>,
    identity: PluginIdentity,
    endpoints: Vec<EndpointSpec>,
    exports: HashSet<Entry>,
    abi: Abi,
    started: AtomicBool,
    module: Mutex<LoadedModule>,
}

impl PluginInstance {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn endpoints(&self) -> &[EndpointSpec] {
        &self.endpoints
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn has(&self, entry: Entry) -> bool {
        self.exports.contains(&entry)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the start export; 0 means started
    pub fn start(&self, config_json: &str) -> PluginResult<i32> {
        let code = lock(&self.module)
            .call_with_text(Entry::Start, config_json)?
            .unwrap_or(0);
        if code == 0 {
            self.started.store(true, Ordering::SeqCst);
        }
        Ok(code)
    }

    pub fn stop(&self) -> PluginResult<i32> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }
        Ok(lock(&self.module).call_no_args(Entry::Stop)?.unwrap_or(0))
    }

    /// Run one poll; `Ok(None)` when the instance is busy with another call
    pub fn poll(&self) -> PluginResult<Option<i32>> {
        let mut module = match self.module.try_lock() {
            Ok(module) => module,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(plugin_id = %self.plugin_id, "instance busy, skipping poll");
                return Ok(None);
            }
        };
        Ok(Some(module.call_no_args(Entry::Poll)?.unwrap_or(0)))
    }

    pub fn deliver_delta(&self, delta_json: &str) -> PluginResult<()> {
        lock(&self.module).call_with_text(Entry::DeltaHandler, delta_json)?;
        Ok(())
    }

    pub fn deliver_event(&self, event_json: &str) -> PluginResult<()> {
        lock(&self.module).call_with_text(Entry::EventHandler, event_json)?;
        Ok(())
    }

    /// Invoke a declared HTTP handler with a JSON request context
    pub fn call_http_handler(&self, handler: &str, ctx_json: &str) -> PluginResult<String> {
        lock(&self.module).call_handler(handler, ctx_json)
    }

    /// Invoke a PUT handler export; `Ok(None)` when the module lacks it
    pub fn call_put_handler(&self, export: &str, value_json: &str) -> PluginResult<Option<String>> {
        lock(&self.module).call_put(export, value_json)
    }
}

/// Removes the in-flight marker when a load finishes either way
struct LoadGuard<'a> {
    loading: &'a Mutex<HashSet<String>>,
    plugin_id: String,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        lock(self.loading).remove(&self.plugin_id);
    }
}

pub struct WasmRuntime {
    engine: Engine,
    providers: Vec<Arc<dyn ProviderRegistry>>,
    instances: Mutex<HashMap<String, Arc<PluginInstance>>>,
    loading: Mutex<HashSet<String>>,
}

impl WasmRuntime {
    pub fn new(providers: Vec<Arc<dyn ProviderRegistry>>) -> PluginResult<Self> {
        let mut config = Config::new();
        config.wasm_threads(false);
        config.async_support(false);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config)
            .map_err(|e| PluginError::wasm("Failed to initialize wasmtime engine", e))?;

        Ok(Self {
            engine,
            providers,
            instances: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
        })
    }

    fn begin_load(&self, plugin_id: &str) -> PluginResult<LoadGuard<'_>> {
        let loaded = lock(&self.instances).contains_key(plugin_id);
        let mut loading = lock(&self.loading);
        if loaded || !loading.insert(plugin_id.to_string()) {
            return Err(PluginError::AlreadyLoaded(plugin_id.to_string()));
        }
        Ok(LoadGuard {
            loading: &self.loading,
            plugin_id: plugin_id.to_string(),
        })
    }

    /// Compile, link and instantiate a plugin module
    pub fn load(&self, spec: LoadSpec, bridge: Arc<Bridge>) -> PluginResult<Arc<PluginInstance>> {
        let plugin_id = spec.plugin_id.clone();
        let _guard = self.begin_load(&plugin_id)?;

        std::fs::create_dir_all(&spec.vfs_root)?;
        let bytes = load_wasm_bytes(&spec.wasm_path, MAX_MODULE_BYTES)?;
        let format = ensure_supported(&bytes)?;
        debug!(plugin_id, format = format.describe(), bytes = bytes.len(), "loading plugin module");

        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| PluginError::wasm("Invalid module", e))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| PluginError::wasm("Failed to link WASI", e))?;
        link_imports(&mut linker, &module)?;

        let mut wasi = WasiCtxBuilder::new();
        wasi.preopened_dir(&spec.vfs_root, "/", DirPerms::all(), FilePerms::all())
            .map_err(|e| PluginError::wasm("Failed to open sandbox root", e))?;

        let mut store = Store::new(
            &self.engine,
            HostState {
                wasi: wasi.build_p1(),
                bridge: bridge.clone(),
                limits: StoreLimitsBuilder::new()
                    .memory_size(MAX_MEMORY_BYTES)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::wasm("Instantiation failed", e))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| PluginError::wasm("_initialize", e))?;
        }

        let guest = GuestMemory::resolve(&mut store, &instance)?;
        let abi = guest.abi();

        let mut funcs = HashMap::new();
        for entry in Entry::ALL {
            match instance.get_func(&mut store, entry.export_name()) {
                Some(func) => {
                    funcs.insert(entry, func);
                }
                None if entry.required() => {
                    return Err(PluginError::ExportMissing(entry.export_name().to_string()));
                }
                None => {}
            }
        }
        let exports: HashSet<Entry> = funcs.keys().copied().collect();

        let mut loaded = LoadedModule {
            store,
            instance,
            guest,
            funcs,
            handlers: HashMap::new(),
        };
        let identity = loaded.read_identity(&plugin_id)?;
        let endpoints = loaded.read_endpoints(&plugin_id);
        loaded.resolve_handlers(&plugin_id, &endpoints);

        info!(
            plugin_id,
            name = %identity.name,
            abi = ?abi,
            endpoints = endpoints.len(),
            "loaded plugin module"
        );

        let instance = Arc::new(PluginInstance {
            plugin_id: plugin_id.clone(),
            spec,
            bridge,
            identity,
            endpoints,
            exports,
            abi,
            started: AtomicBool::new(false),
            module: Mutex::new(loaded),
        });
        lock(&self.instances).insert(plugin_id, instance.clone());
        Ok(instance)
    }

    /// Stop (if started), leave provider registries, drop the instance
    pub fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        let instance = lock(&self.instances)
            .remove(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded(plugin_id.to_string()))?;

        match instance.stop() {
            Ok(0) => {}
            Ok(code) => debug!(plugin_id, code, "plugin_stop returned non-zero during unload"),
            Err(e) => warn!(plugin_id, error = %e, "plugin_stop failed during unload"),
        }
        for registry in &self.providers {
            registry.unregister_plugin(plugin_id);
        }
        debug!(plugin_id, "unloaded plugin module");
        Ok(())
    }

    /// Unload and load again from the remembered `LoadSpec`
    pub fn reload(&self, plugin_id: &str) -> PluginResult<Arc<PluginInstance>> {
        let current = self
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded(plugin_id.to_string()))?;
        let spec = current.spec.clone();
        let bridge = current.bridge.clone();
        drop(current);

        self.unload(plugin_id)?;
        self.load(spec, bridge)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<PluginInstance>> {
        lock(&self.instances).get(plugin_id).cloned()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        lock(&self.instances).contains_key(plugin_id)
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.instances).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        for plugin_id in self.loaded_ids() {
            if let Err(e) = self.unload(&plugin_id) {
                warn!(plugin_id, error = %e, "unload during shutdown failed");
            }
        }
        info!("plugin runtime shut down");
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod runtime_tests;
