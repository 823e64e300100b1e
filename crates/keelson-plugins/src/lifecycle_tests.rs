//! Lifecycle tests

use keelson_core::model::{Delta, ServerEvent};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::*;
use crate::test_guest::{Guest, enable, eventually, install_package, test_host};

const STATUS_IMPORT: &str = r#"(import "env" "sk_set_status" (func $status (param i32 i32)))"#;

fn delta_echo_guest() -> Guest {
    Guest::basic("Speed Echo")
        .import(STATUS_IMPORT)
        .func(
            r#"(func (export "delta_handler") (param $ptr i32) (param $len i32)
                 (call $status (local.get $ptr) (local.get $len)))"#,
        )
}

fn event_echo_guest() -> Guest {
    Guest::basic("Event Echo")
        .import(STATUS_IMPORT)
        .func(
            r#"(func (export "event_handler") (param $ptr i32) (param $len i32)
                 (call $status (local.get $ptr) (local.get $len)))"#,
        )
}

fn payloads(statuses: Vec<String>, needle: &str) -> Vec<String> {
    statuses.into_iter().filter(|s| s.contains(needle)).collect()
}

#[test]
fn test_backoff_doubles_and_saturates() {
    let mut backoff = RESTART_BACKOFF_FLOOR;
    let mut seen = Vec::new();
    for _ in 0..7 {
        backoff = next_backoff(backoff);
        seen.push(backoff.as_millis() as u64);
    }
    assert_eq!(seen, vec![2000, 4000, 8000, 16000, 30000, 30000, 30000]);
    assert_eq!(next_backoff(Duration::ZERO), Duration::from_secs(2));
}

#[tokio::test]
async fn test_delta_reaches_handler_exactly_once() {
    let dir = TempDir::new().expect("tempdir");
    let (host, app) = test_host(dir.path());
    let location = install_package(
        &dir.path().join("packages"),
        "speed-echo",
        &delta_echo_guest(),
        json!({"wasmCapabilities": {"dataWrite": true}}),
    );
    enable(dir.path(), "speed-echo");

    let id = host.register("speed-echo", None, &location).await.expect("register");
    assert_eq!(host.status(&id), Some(PluginStatus::Running));

    host.route_delta(&Delta::single(None, "navigation.speedOverGround", json!(3.85)));

    assert!(eventually(|| !payloads(app.statuses_for(&id), "navigation.speedOverGround").is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = payloads(app.statuses_for(&id), "navigation.speedOverGround");
    assert_eq!(seen.len(), 1);
    let delivered: Value = serde_json::from_str(&seen[0]).expect("handler got JSON");
    assert_eq!(delivered["updates"][0]["values"][0]["path"], json!("navigation.speedOverGround"));
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let (host, app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "idem", &delta_echo_guest(), json!({}));
    enable(dir.path(), "idem");
    let id = host.register("idem", None, &location).await.expect("register");

    host.start(&id).await.expect("second start");
    host.start(&id).await.expect("third start");

    assert_eq!(host.services().deltas.subscription_count(), 1);
    assert_eq!(lock(&host.inner.wiring).len(), 1);

    host.route_delta(&Delta::single(None, "environment.depth.belowKeel", json!(4.2)));
    assert!(eventually(|| !payloads(app.statuses_for(&id), "belowKeel").is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(payloads(app.statuses_for(&id), "belowKeel").len(), 1);
}

#[tokio::test]
async fn test_start_failure_sets_error() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let guest = Guest::default()
        .string("plugin_name", "Refuser")
        .func(r#"(func (export "plugin_start") (param i32 i32) (result i32) (i32.const 5))"#)
        .func(r#"(func (export "plugin_stop") (result i32) (i32.const 0))"#);
    let location = install_package(&dir.path().join("packages"), "refuser", &guest, json!({}));
    enable(dir.path(), "refuser");

    // registration succeeds even though the start fails
    let id = host.register("refuser", None, &location).await.expect("register");
    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Error);
    assert!(summary.error_message.unwrap_or_default().contains("error code 5"));
    assert!(summary.loaded);

    let err = host.start(&id).await.unwrap_err();
    assert!(matches!(err, PluginError::StartFailure(_)));
}

#[tokio::test]
async fn test_stop_and_unload() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "stopper", &delta_echo_guest(), json!({}));
    enable(dir.path(), "stopper");
    let id = host.register("stopper", None, &location).await.expect("register");

    host.stop(&id).await.expect("stop");
    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Stopped);
    assert!(summary.loaded);
    assert!(!host.services().deltas.is_subscribed(&id));

    host.unload(&id).await.expect("unload");
    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Stopped);
    assert!(!summary.loaded);
    assert!(!host.runtime().is_loaded(&id));
    assert!(host.routes().resolve("GET", "/plugins/stopper").is_none());

    assert!(matches!(host.start(&id).await, Err(PluginError::NotLoaded(_))));
}

#[tokio::test(start_paused = true)]
async fn test_three_crashes_disable_restart() {
    let dir = TempDir::new().expect("tempdir");
    let (host, app) = test_host(dir.path());
    let guest = Guest::basic("Crasher").func(r#"(func (export "poll") (result i32) unreachable)"#);
    let location = install_package(&dir.path().join("packages"), "crasher", &guest, json!({}));
    enable(dir.path(), "crasher");
    let id = host.register("crasher", None, &location).await.expect("register");
    assert_eq!(host.status(&id), Some(PluginStatus::Running));

    for _ in 0..120 {
        if host.status(&id) == Some(PluginStatus::Error) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Error);
    assert_eq!(summary.crash_count, MAX_CRASHES);
    assert_eq!(summary.error_message.as_deref(), Some(CRASH_LIMIT_MESSAGE));
    assert!(summary.last_crash.is_some());
    assert!(!host.has_pending_restart(&id));
    assert!(app.statuses_for(&id).iter().any(|s| s == "Recovered from crash"));

    // no fourth attempt
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(host.get(&id).expect("summary").crash_count, MAX_CRASHES);
    assert!(!host.has_pending_restart(&id));
}

#[tokio::test(start_paused = true)]
async fn test_first_crash_schedules_restart() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let guest = Guest::basic("Once").func(r#"(func (export "poll") (result i32) unreachable)"#);
    let location = install_package(&dir.path().join("packages"), "once", &guest, json!({}));
    enable(dir.path(), "once");
    let id = host.register("once", None, &location).await.expect("register");

    assert!(eventually(|| host.status(&id) == Some(PluginStatus::Crashed)).await);
    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.crash_count, 1);
    assert!(host.has_pending_restart(&id));
    assert_eq!(
        lock(&host.record(&id).expect("record")).restart_backoff,
        Duration::from_secs(2)
    );

    // an explicit stop cancels the pending restart
    host.stop(&id).await.expect("stop");
    assert!(!host.has_pending_restart(&id));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(host.status(&id), Some(PluginStatus::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_crashes_far_apart_never_reach_the_limit() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "flaky", &Guest::basic("Flaky"), json!({}));
    enable(dir.path(), "flaky");
    let id = host.register("flaky", None, &location).await.expect("register");

    // two crashes inside the window count together
    host.handle_crash(&id, "boom");
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(host.status(&id), Some(PluginStatus::Running));
    host.handle_crash(&id, "boom");
    assert_eq!(host.get(&id).expect("summary").crash_count, 2);

    // a day of stable running later, the third crash starts a new streak
    tokio::time::sleep(Duration::from_secs(86_400)).await;
    assert_eq!(host.status(&id), Some(PluginStatus::Running));
    host.handle_crash(&id, "boom");

    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Crashed);
    assert_eq!(summary.crash_count, 1);
    assert!(host.has_pending_restart(&id));
    assert_eq!(
        lock(&host.record(&id).expect("record")).restart_backoff,
        Duration::from_secs(2)
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(host.status(&id), Some(PluginStatus::Running));
}

#[tokio::test]
async fn test_reload_preserves_event_order() {
    let dir = TempDir::new().expect("tempdir");
    let (host, app) = test_host(dir.path());
    let location = install_package(
        &dir.path().join("packages"),
        "event-echo",
        &event_echo_guest(),
        json!({"wasmCapabilities": {"serverEvents": true}}),
    );
    enable(dir.path(), "event-echo");
    let id = host.register("event-echo", None, &location).await.expect("register");
    assert!(host.services().events.is_subscribed(&id));
    let before = host.runtime().get(&id).expect("instance");

    let emit = |n: u32| host.route_event(&ServerEvent::new("PLUGIN_TICK", json!({"n": n})));
    let seen = || -> Vec<u64> {
        payloads(app.statuses_for(&id), "PLUGIN_TICK")
            .iter()
            .filter_map(|s| serde_json::from_str::<Value>(s).ok())
            .filter_map(|v| v["data"]["n"].as_u64())
            .collect()
    };
    emit(1);
    emit(2);
    assert!(eventually(|| seen().len() == 2).await);

    let reloader = host.clone();
    let reload_id = id.clone();
    let reload = tokio::spawn(async move { reloader.reload(&reload_id).await });
    tokio::task::yield_now().await;
    for n in 3..=5 {
        emit(n);
    }
    reload.await.expect("join").expect("reload");
    emit(6);
    emit(7);

    assert!(eventually(|| seen().len() >= 7).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen(), vec![1, 2, 3, 4, 5, 6, 7]);

    let after = host.runtime().get(&id).expect("instance");
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(host.status(&id), Some(PluginStatus::Running));
    assert!(!host.services().events.is_buffering(&id));
}

#[tokio::test]
async fn test_event_handler_without_capability_is_not_wired() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "no-events", &event_echo_guest(), json!({}));
    enable(dir.path(), "no-events");
    let id = host.register("no-events", None, &location).await.expect("register");

    assert_eq!(host.status(&id), Some(PluginStatus::Running));
    assert!(!host.services().events.is_subscribed(&id));
}

#[tokio::test]
async fn test_reload_of_missing_binary_is_reload_failure() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "vanishing", &Guest::basic("Gone"), json!({}));
    enable(dir.path(), "vanishing");
    let id = host.register("vanishing", None, &location).await.expect("register");

    std::fs::remove_file(location.join("plugin.wasm")).expect("remove binary");
    let err = host.reload(&id).await.unwrap_err();
    assert!(matches!(err, PluginError::ReloadFailure(_)));

    let summary = host.get(&id).expect("summary");
    assert_eq!(summary.status, PluginStatus::Error);
    assert!(summary.error_message.unwrap_or_default().starts_with("Reload failed"));
}

#[tokio::test]
async fn test_network_starts_are_serialized() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let packages = dir.path().join("packages");
    let net = install_package(
        &packages,
        "net-plugin",
        &Guest::basic("Net"),
        json!({"wasmCapabilities": {"network": true}}),
    );
    let local = install_package(&packages, "local-plugin", &Guest::basic("Local"), json!({}));
    let net_id = host.register("net-plugin", None, &net).await.expect("register net");
    let local_id = host.register("local-plugin", None, &local).await.expect("register local");
    host.load_instance(&net_id).await.expect("load net");
    host.load_instance(&local_id).await.expect("load local");

    let held = host.inner.network_start.lock().await;
    let starter = host.clone();
    let start_id = net_id.clone();
    let pending = tokio::spawn(async move { starter.start(&start_id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.status(&net_id), Some(PluginStatus::Starting));

    // plugins without network are not held back
    host.start(&local_id).await.expect("start local");
    assert_eq!(host.status(&local_id), Some(PluginStatus::Running));

    drop(held);
    pending.await.expect("join").expect("start net");
    assert_eq!(host.status(&net_id), Some(PluginStatus::Running));
}

#[tokio::test]
async fn test_shutdown_all_resets_host() {
    let dir = TempDir::new().expect("tempdir");
    let (host, _app) = test_host(dir.path());
    let location = install_package(&dir.path().join("packages"), "bye", &delta_echo_guest(), json!({}));
    enable(dir.path(), "bye");
    let id = host.register("bye", None, &location).await.expect("register");

    host.shutdown_all().await;

    assert!(host.list().is_empty());
    assert!(host.runtime().loaded_ids().is_empty());
    assert!(host.routes().resolve("GET", "/plugins/bye").is_none());
    assert_eq!(host.services().deltas.subscription_count(), 0);

    // the same package can be registered again
    let again = host.register("bye", None, &location).await.expect("register again");
    assert_eq!(again, id);
    assert_eq!(host.status(&id), Some(PluginStatus::Running));
}
