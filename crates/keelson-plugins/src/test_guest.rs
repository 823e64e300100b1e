//! Guest modules assembled from WAT, plus a recording server, for tests

use keelson_core::model::{Delta, ServerEvent, SkVersion};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::host::{HostOptions, PluginHost, ServerApp};
use crate::manifest::sanitize_package_name;
use crate::storage::{PluginConfigFile, PluginStorage};

const DATA_START: usize = 1024;
const HEAP_START: usize = 65_536;
const MEMORY_PAGES: usize = 4;

fn hex(text: &str) -> String {
    text.bytes().map(|b| format!("\\{b:02x}")).collect()
}

/// Buffer-ABI guest with a wrapping bump allocator
#[derive(Debug, Clone, Default)]
pub(crate) struct Guest {
    imports: Vec<String>,
    strings: Vec<(String, String)>,
    segments: Vec<(usize, String)>,
    funcs: Vec<String>,
}

impl Guest {
    /// Named plugin whose start returns 0 and whose stop does nothing
    pub(crate) fn basic(name: &str) -> Self {
        Self::default()
            .string("plugin_name", name)
            .func(r#"(func (export "plugin_start") (param i32 i32) (result i32) (i32.const 0))"#)
            .func(r#"(func (export "plugin_stop") (result i32) (i32.const 0))"#)
    }

    pub(crate) fn import(mut self, wat: &str) -> Self {
        self.imports.push(wat.to_string());
        self
    }

    /// Export `name(out_ptr, max) -> written` returning fixed text
    pub(crate) fn string(mut self, name: &str, text: &str) -> Self {
        self.strings.push((name.to_string(), text.to_string()));
        self
    }

    /// Place `text` at a fixed offset below the heap
    pub(crate) fn data(mut self, offset: usize, text: &str) -> Self {
        assert!(offset + text.len() <= HEAP_START, "data segment overlaps the heap");
        self.segments.push((offset, text.to_string()));
        self
    }

    pub(crate) fn func(mut self, wat: &str) -> Self {
        self.funcs.push(wat.to_string());
        self
    }

    pub(crate) fn wat(&self) -> String {
        let mut data = String::new();
        let mut exports = String::new();
        let mut offset = DATA_START;
        for (name, text) in &self.strings {
            let len = text.len();
            data.push_str(&format!("(data (i32.const {offset}) \"{}\")\n", hex(text)));
            exports.push_str(&format!(
                "(func (export \"{name}\") (param $out i32) (param $max i32) (result i32)
                   (memory.copy (local.get $out) (i32.const {offset}) (i32.const {len}))
                   (i32.const {len}))\n"
            ));
            offset += len + 8;
        }
        for (at, text) in &self.segments {
            data.push_str(&format!("(data (i32.const {at}) \"{}\")\n", hex(text)));
        }
        let limit = MEMORY_PAGES * 65_536;
        format!(
            r#"(module
  {imports}
  (memory (export "memory") {MEMORY_PAGES})
  {data}
  (global $next (mut i32) (i32.const {HEAP_START}))
  (func (export "allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (if (i32.gt_u (i32.add (global.get $next) (local.get $size)) (i32.const {limit}))
      (then (global.set $next (i32.const {HEAP_START}))))
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $size)))
    (local.get $ptr))
  (func (export "deallocate") (param i32 i32))
  {exports}
  {funcs})"#,
            imports = self.imports.join("\n  "),
            funcs = self.funcs.join("\n  "),
        )
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).expect("assemble guest")
    }

    /// Write `plugin.wasm` to `path`
    pub(crate) fn write_to(&self, path: &Path) {
        fs::write(path, self.bytes()).expect("write guest");
    }
}

/// Lay out an installed package: `<root>/<package>/{package.json, plugin.wasm}`
pub(crate) fn install_package(root: &Path, package_name: &str, guest: &Guest, extra: Value) -> PathBuf {
    let location = root.join(sanitize_package_name(package_name));
    fs::create_dir_all(&location).expect("package dir");
    guest.write_to(&location.join("plugin.wasm"));

    let mut manifest = serde_json::json!({
        "name": package_name,
        "version": "1.2.3",
        "wasmManifest": "plugin.wasm",
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut manifest, extra) {
        base.extend(extra);
    }
    fs::write(
        location.join("package.json"),
        serde_json::to_string_pretty(&manifest).expect("manifest"),
    )
    .expect("write manifest");
    location
}

/// Server stand-in that records what plugins send it
#[derive(Default)]
pub(crate) struct RecordingApp {
    pub deltas: Mutex<Vec<(String, Delta, SkVersion)>>,
    pub statuses: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<(String, String)>>,
    pub events: Mutex<Vec<ServerEvent>>,
}

impl RecordingApp {
    pub(crate) fn statuses_for(&self, plugin_id: &str) -> Vec<String> {
        self.statuses
            .lock()
            .expect("lock")
            .iter()
            .filter(|(id, _)| id == plugin_id)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

impl ServerApp for RecordingApp {
    fn handle_message(&self, plugin_id: &str, delta: Delta, version: SkVersion) {
        self.deltas
            .lock()
            .expect("lock")
            .push((plugin_id.to_string(), delta, version));
    }

    fn get_self_path(&self, _path: &str) -> Option<Value> {
        None
    }

    fn get_path(&self, _path: &str) -> Option<Value> {
        None
    }

    fn set_plugin_status(&self, plugin_id: &str, message: &str) {
        self.statuses
            .lock()
            .expect("lock")
            .push((plugin_id.to_string(), message.to_string()));
    }

    fn set_plugin_error(&self, plugin_id: &str, message: &str) {
        self.errors
            .lock()
            .expect("lock")
            .push((plugin_id.to_string(), message.to_string()));
    }

    fn emit_event(&self, event: &ServerEvent) {
        self.events.lock().expect("lock").push(event.clone());
    }
}

/// Host rooted at `<root>/config` with a recording server behind it
pub(crate) fn test_host(root: &Path) -> (PluginHost, Arc<RecordingApp>) {
    let app = Arc::new(RecordingApp::default());
    let host = PluginHost::new(HostOptions::new(root.join("config")), app.clone(), Vec::new())
        .expect("plugin host");
    (host, app)
}

/// Persist `{enabled: true}` for a plugin before it is registered
pub(crate) fn enable(root: &Path, plugin_id: &str) {
    PluginStorage::new(root.join("config"))
        .write_config(
            plugin_id,
            &PluginConfigFile {
                enabled: true,
                ..Default::default()
            },
        )
        .expect("write plugin config");
}

/// Poll `check` until it holds, sleeping on the tokio clock in between
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
