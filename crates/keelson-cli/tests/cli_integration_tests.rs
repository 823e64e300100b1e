//! CLI integration tests for keelson
//!
//! Runs the keelson binary end-to-end with an isolated config directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Command with its config directory pointed into `dir`
#[allow(deprecated)]
fn keelson_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("keelson").unwrap();
    cmd.env("KEELSON_CONFIG_DIR", dir.path().join("config"));
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Installed package whose module only reports its name
fn install_named_plugin(packages: &Path, package_name: &str, name: &str) {
    let location = packages.join(package_name);
    fs::create_dir_all(&location).unwrap();
    let hex: String = name.bytes().map(|b| format!("\\{b:02x}")).collect();
    let len = name.len();
    let module = wat::parse_str(format!(
        r#"(module
  (memory (export "memory") 2)
  (data (i32.const 1024) "{hex}")
  (global $next (mut i32) (i32.const 65536))
  (func (export "allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $size)))
    (local.get $ptr))
  (func (export "deallocate") (param i32 i32))
  (func (export "plugin_name") (param $out i32) (param $max i32) (result i32)
    (memory.copy (local.get $out) (i32.const 1024) (i32.const {len}))
    (i32.const {len}))
  (func (export "plugin_start") (param i32 i32) (result i32) (i32.const 0))
  (func (export "plugin_stop") (result i32) (i32.const 0)))"#
    ))
    .unwrap();
    fs::write(location.join("plugin.wasm"), module).unwrap();
    fs::write(
        location.join("package.json"),
        format!(r#"{{"name":"{package_name}","version":"0.4.1","wasmManifest":"plugin.wasm"}}"#),
    )
    .unwrap();
}

#[test]
fn test_config_path_follows_env() {
    let dir = TempDir::new().unwrap();
    let expected = dir.path().join("config").join("config.toml");

    keelson_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.display().to_string()));
}

#[test]
fn test_config_set_then_get() {
    let dir = TempDir::new().unwrap();

    keelson_cmd(&dir)
        .args(["config", "set", "server.port", "3100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set server.port = 3100"));

    keelson_cmd(&dir)
        .args(["config", "get", "server.port"])
        .assert()
        .success()
        .stdout(predicate::str::diff("3100\n"));

    let saved = fs::read_to_string(dir.path().join("config").join("config.toml")).unwrap();
    assert!(saved.contains("port = 3100"), "config file should hold the port: {saved}");
}

#[test]
fn test_config_show_lists_every_key() {
    let dir = TempDir::new().unwrap();

    keelson_cmd(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("server.host = 127.0.0.1"))
        .stdout(predicate::str::contains("plugins.handler_timeout_secs = 10"))
        .stdout(predicate::str::contains("plugins.poll_interval_ms = 1000"));
}

#[test]
fn test_config_rejects_unknown_key_and_bad_values() {
    let dir = TempDir::new().unwrap();

    keelson_cmd(&dir)
        .args(["config", "set", "server.colour", "blue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));

    keelson_cmd(&dir)
        .args(["config", "set", "plugins.handler_timeout_secs", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("handler_timeout_secs"));

    assert!(!dir.path().join("config").join("config.toml").exists());
}

#[test]
fn test_inspect_core_module() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plugin.wasm");
    fs::write(&file, wat::parse_str("(module)").unwrap()).unwrap();

    keelson_cmd(&dir)
        .arg("inspect")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("core module (wasi preview 1)"));
}

#[test]
fn test_inspect_rejects_component_binary() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("component.wasm");
    fs::write(&file, [0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x01, 0x00]).unwrap();

    keelson_cmd(&dir)
        .arg("inspect")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("component model"))
        .stderr(predicate::str::contains("wasm32-wasip1"));
}

#[test]
fn test_inspect_missing_file() {
    let dir = TempDir::new().unwrap();

    keelson_cmd(&dir)
        .args(["inspect", "nowhere.wasm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_plugins_list_without_packages() {
    let dir = TempDir::new().unwrap();

    keelson_cmd(&dir)
        .args(["plugins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins registered"));
}

#[test]
fn test_plugins_list_shows_disabled_package() {
    let dir = TempDir::new().unwrap();
    let packages = dir.path().join("node_modules");
    install_named_plugin(&packages, "anchor-watch", "Anchor Watch");

    keelson_cmd(&dir)
        .args(["config", "set", "plugins.package_dirs"])
        .arg(packages.display().to_string())
        .assert()
        .success();

    keelson_cmd(&dir)
        .args(["plugins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("anchor-watch"))
        .stdout(predicate::str::contains("stopped"))
        .stdout(predicate::str::contains("0.4.1"))
        .stdout(predicate::str::contains("Anchor Watch"));
}

#[test]
fn test_plugins_list_json() {
    let dir = TempDir::new().unwrap();
    let packages = dir.path().join("node_modules");
    install_named_plugin(&packages, "anchor-watch", "Anchor Watch");

    keelson_cmd(&dir)
        .args(["config", "set", "plugins.package_dirs"])
        .arg(packages.display().to_string())
        .assert()
        .success();

    let output = keelson_cmd(&dir)
        .args(["plugins", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plugins: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plugins[0]["id"], "anchor-watch");
    assert_eq!(plugins[0]["status"], "stopped");
    assert_eq!(plugins[0]["enabled"], false);
    assert_eq!(plugins[0]["loaded"], false);
}

#[test]
fn test_plugins_list_does_not_start_enabled_package() {
    let dir = TempDir::new().unwrap();
    let packages = dir.path().join("node_modules");
    install_named_plugin(&packages, "anchor-watch", "Anchor Watch");
    let data = dir.path().join("config").join("plugin-config-data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("anchor-watch.json"), r#"{"enabled":true,"enableDebug":false}"#).unwrap();

    keelson_cmd(&dir)
        .args(["config", "set", "plugins.package_dirs"])
        .arg(packages.display().to_string())
        .assert()
        .success();

    let output = keelson_cmd(&dir)
        .args(["plugins", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plugins: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plugins[0]["id"], "anchor-watch");
    assert_eq!(plugins[0]["enabled"], true);
    assert_eq!(plugins[0]["status"], "stopped");
    assert_eq!(plugins[0]["loaded"], false);
    assert!(!data.join("anchor-watch").exists(), "listing must not create the plugin sandbox");
}
