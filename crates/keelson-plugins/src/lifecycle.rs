//! Plugin lifecycle: start, stop, unload, reload and crash recovery
//!
//! ```text
//! stopped -> starting -> running -> crashed -> (backoff) -> starting
//!                           |          \-> error after MAX_CRASHES
//!                           \-> stopped
//! ```
//!
//! Module calls run on the blocking pool and never while a plugin record
//! is locked, so host functions invoked from inside a call can update the
//! record they belong to. Deltas and events reach a running plugin through
//! one dispatcher task per plugin, which keeps them in emission order.

use chrono::Utc;
use keelson_core::model::{Delta, ServerEvent};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::capabilities::Capabilities;
use crate::events::EventCallback;
use crate::host::{HostInner, PluginHost, PluginStatus, lock};
use crate::runtime::{Entry, PluginInstance};
use crate::subscriptions::{ALL_PATHS, DeltaCallback};
use crate::{PluginError, PluginResult};

pub(crate) const RESTART_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub(crate) const RESTART_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Consecutive crashes after which automatic restart is disabled
pub const MAX_CRASHES: u32 = 3;

/// A crash this long after the previous one starts a fresh crash streak
pub const CRASH_COUNT_WINDOW: Duration = Duration::from_secs(60);

pub const CRASH_LIMIT_MESSAGE: &str = "Plugin repeatedly crashing, automatic restart disabled";

/// Backoff to wait before the next restart attempt
pub fn next_backoff(current: Duration) -> Duration {
    (current.max(RESTART_BACKOFF_FLOOR) * 2).min(RESTART_BACKOFF_CEILING)
}

/// Payload queued for a plugin's dispatcher
#[derive(Debug)]
pub(crate) enum Delivery {
    Delta(String),
    Event(String),
}

/// Tasks and subscriptions set up for a running plugin
#[derive(Default)]
pub(crate) struct Wiring {
    poll: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    tx: Option<UnboundedSender<Delivery>>,
}

impl Wiring {
    fn abort(self) {
        if let Some(poll) = self.poll {
            poll.abort();
        }
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }
    }
}

fn delta_sender(tx: UnboundedSender<Delivery>) -> DeltaCallback {
    Arc::new(move |delta: &Delta| match delta.to_json() {
        Ok(json) => {
            let _ = tx.send(Delivery::Delta(json));
        }
        Err(e) => warn!(error = %e, "failed to serialize delta for plugin"),
    })
}

fn event_sender(tx: UnboundedSender<Delivery>) -> EventCallback {
    Arc::new(move |event: &ServerEvent| match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(Delivery::Event(json));
        }
        Err(e) => warn!(error = %e, "failed to serialize event for plugin"),
    })
}

async fn dispatch_loop(
    host: Weak<HostInner>,
    plugin_id: String,
    instance: Arc<PluginInstance>,
    mut rx: UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        let inst = instance.clone();
        let outcome = tokio::task::spawn_blocking(move || match delivery {
            Delivery::Delta(json) => inst.deliver_delta(&json),
            Delivery::Event(json) => inst.deliver_event(&json),
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if let Some(host) = PluginHost::from_weak(&host) {
                    host.handle_crash(&plugin_id, &e.to_string());
                }
                break;
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "delivery task failed");
                break;
            }
        }
    }
}

async fn poll_loop(host: Weak<HostInner>, plugin_id: String, instance: Arc<PluginInstance>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let inst = instance.clone();
        match tokio::task::spawn_blocking(move || inst.poll()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if let Some(host) = PluginHost::from_weak(&host) {
                    host.handle_crash(&plugin_id, &e.to_string());
                }
                break;
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "poll task failed");
                break;
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> PluginResult<T>
where
    F: FnOnce() -> PluginResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::Crashed(format!("module call aborted: {e}")))?
}

impl PluginHost {
    /// Start a loaded plugin; a no-op if it is already running
    pub async fn start(&self, plugin_id: &str) -> PluginResult<()> {
        self.start_internal(plugin_id, false).await
    }

    pub(crate) async fn start_internal(&self, plugin_id: &str, recovering: bool) -> PluginResult<()> {
        let record = self.record(plugin_id)?;
        if !recovering {
            self.cancel_restart_timer(plugin_id);
        }
        let (instance, capabilities, payload) = {
            let mut plugin = lock(&record);
            if matches!(plugin.status, PluginStatus::Running | PluginStatus::Starting) {
                debug!(plugin_id, status = %plugin.status, "start requested, already running");
                return Ok(());
            }
            let Some(instance) = plugin.instance.clone() else {
                return Err(PluginError::NotLoaded(plugin_id.to_string()));
            };
            plugin.status = PluginStatus::Starting;
            plugin.status_message = None;
            (instance, plugin.capabilities.clone(), plugin.config.start_payload())
        };
        let services = self.inner.services.clone();
        services.app.set_plugin_status(plugin_id, "Starting");

        // shared networking state inside guests does not survive concurrent starts
        let _network_guard = if capabilities.network {
            debug!(plugin_id, "waiting for network plugin start lock");
            Some(self.inner.network_start.lock().await)
        } else {
            None
        };

        let config_json = payload.to_string();
        let inst = instance.clone();
        let outcome = run_blocking(move || inst.start(&config_json)).await;

        let failure = match outcome {
            Ok(0) => None,
            Ok(code) => Some(format!("Plugin start returned error code {code}")),
            Err(e) => Some(format!("Plugin start failed: {e}")),
        };

        if let Some(message) = failure {
            services.plugins.update(plugin_id, |plugin| {
                plugin.status = PluginStatus::Error;
                plugin.error_message = Some(message.clone());
            });
            services.app.set_plugin_error(plugin_id, &message);
            error!(plugin_id, error = %message, "plugin failed to start");
            return Err(PluginError::StartFailure(message));
        }

        let status_message = {
            let mut plugin = lock(&record);
            plugin.status = PluginStatus::Running;
            plugin.error_message = None;
            if recovering {
                plugin.status_message = Some("Recovered from crash".to_string());
            } else {
                plugin.crash_count = 0;
                plugin.restart_backoff = RESTART_BACKOFF_FLOOR;
                if plugin.status_message.is_none() {
                    plugin.status_message = Some("Running".to_string());
                }
            }
            plugin.status_message.clone().unwrap_or_default()
        };
        services.app.set_plugin_status(plugin_id, &status_message);

        self.wire(plugin_id, &instance, &capabilities);
        info!(plugin_id, recovering, "plugin started");
        Ok(())
    }

    fn wire(&self, plugin_id: &str, instance: &Arc<PluginInstance>, capabilities: &Capabilities) {
        let services = &self.inner.services;
        let mut wiring = Wiring::default();

        let wants_deltas = instance.has(Entry::DeltaHandler);
        let wants_events = instance.has(Entry::EventHandler) && capabilities.server_events;
        if instance.has(Entry::EventHandler) && !capabilities.server_events {
            warn!(plugin_id, "plugin exports event_handler without serverEvents capability, not subscribed");
        }

        if wants_deltas || wants_events {
            let (tx, rx) = mpsc::unbounded_channel();
            wiring.dispatcher = Some(tokio::spawn(dispatch_loop(
                self.downgrade(),
                plugin_id.to_string(),
                instance.clone(),
                rx,
            )));
            if wants_deltas {
                services
                    .deltas
                    .subscribe(plugin_id, vec![ALL_PATHS.to_string()], delta_sender(tx.clone()));
            }
            if wants_events {
                let filter = services.events.requested_filter(plugin_id);
                services.events.subscribe(plugin_id, &filter, event_sender(tx.clone()));
            }
            wiring.tx = Some(tx);
        }

        if instance.has(Entry::Poll) {
            let period = self.inner.options.poll_interval;
            wiring.poll = Some(tokio::spawn(poll_loop(
                self.downgrade(),
                plugin_id.to_string(),
                instance.clone(),
                period,
            )));
            debug!(plugin_id, period_ms = period.as_millis() as u64, "poll timer started");
        }

        if let Some(previous) = lock(&self.inner.wiring).insert(plugin_id.to_string(), wiring) {
            previous.abort();
        }
    }

    fn unwire(&self, plugin_id: &str) {
        if let Some(wiring) = lock(&self.inner.wiring).remove(plugin_id) {
            wiring.abort();
        }
        self.inner.services.deltas.unsubscribe(plugin_id);
        self.inner.services.events.unsubscribe(plugin_id);
    }

    fn delivery_sender(&self, plugin_id: &str) -> Option<UnboundedSender<Delivery>> {
        lock(&self.inner.wiring)
            .get(plugin_id)
            .and_then(|w| w.tx.clone())
    }

    /// Stop a plugin: timers, subscriptions, the module's stop export, sockets
    pub async fn stop(&self, plugin_id: &str) -> PluginResult<()> {
        let record = self.record(plugin_id)?;
        self.cancel_restart_timer(plugin_id);
        self.unwire(plugin_id);

        let instance = lock(&record).instance.clone();
        if let Some(instance) = instance {
            match run_blocking(move || instance.stop()).await {
                Ok(0) => {}
                Ok(code) => warn!(plugin_id, code, "plugin_stop returned non-zero"),
                Err(e) => warn!(plugin_id, error = %e, "plugin_stop failed"),
            }
        }

        let services = &self.inner.services;
        let closed = services.sockets.close_all_for_plugin(plugin_id)
            + services.tcp.close_all_for_plugin(plugin_id);
        if closed > 0 {
            debug!(plugin_id, closed, "closed plugin sockets");
        }

        {
            let mut plugin = lock(&record);
            plugin.status = PluginStatus::Stopped;
            plugin.status_message = Some("Stopped".to_string());
        }
        self.inner.services.app.set_plugin_status(plugin_id, "Stopped");
        info!(plugin_id, "plugin stopped");
        Ok(())
    }

    /// Stop if needed, drop routes, PUT claims and the module instance
    pub async fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        let record = self.record(plugin_id)?;
        let (active, loaded) = {
            let plugin = lock(&record);
            (
                matches!(
                    plugin.status,
                    PluginStatus::Running | PluginStatus::Starting | PluginStatus::Crashed
                ),
                plugin.instance.is_some(),
            )
        };
        if active {
            self.stop(plugin_id).await?;
        } else {
            self.cancel_restart_timer(plugin_id);
            self.unwire(plugin_id);
        }

        self.inner.routes.remove_plugin(plugin_id);
        self.inner.services.events.remove_plugin(plugin_id);
        self.inner.services.deltas.remove_plugin(plugin_id);
        self.inner.services.puts.remove_plugin(plugin_id);
        if loaded {
            match self.inner.runtime.unload(plugin_id) {
                Ok(()) | Err(PluginError::NotLoaded(_)) => {}
                Err(e) => warn!(plugin_id, error = %e, "runtime unload failed"),
            }
        }

        {
            let mut plugin = lock(&record);
            plugin.instance = None;
            if plugin.status != PluginStatus::Error {
                plugin.status = PluginStatus::Stopped;
            }
        }
        info!(plugin_id, "plugin unloaded");
        Ok(())
    }

    /// Swap in a fresh instance of the plugin's binary, buffering deliveries
    pub async fn reload(&self, plugin_id: &str) -> PluginResult<()> {
        self.reload_with(plugin_id, false).await
    }

    pub(crate) async fn reload_with(&self, plugin_id: &str, recovering: bool) -> PluginResult<()> {
        let record = self.record(plugin_id)?;
        let (was_running, instance, capabilities) = {
            let plugin = lock(&record);
            (
                matches!(plugin.status, PluginStatus::Running | PluginStatus::Crashed),
                plugin.instance.clone(),
                plugin.capabilities.clone(),
            )
        };
        let Some(instance) = instance else {
            return Err(PluginError::NotLoaded(plugin_id.to_string()));
        };

        let services = self.inner.services.clone();
        let buffer_events = instance.has(Entry::EventHandler) && capabilities.server_events;
        let buffer_deltas = instance.has(Entry::DeltaHandler);
        if buffer_events {
            services.events.start_buffering(plugin_id);
        }
        if buffer_deltas {
            services.deltas.start_buffering(plugin_id);
        }
        drop(instance);
        info!(plugin_id, was_running, recovering, "reloading plugin");

        let outcome = self.swap_instance(plugin_id, was_running, recovering).await;

        let sender = self.delivery_sender(plugin_id);
        if buffer_events {
            let callback = sender.clone().map(event_sender);
            let replayed = services.events.stop_buffering_and_replay(plugin_id, callback.as_ref());
            debug!(plugin_id, replayed, "replayed buffered events");
        }
        if buffer_deltas {
            let callback = sender.map(delta_sender);
            let replayed = services.deltas.stop_buffering_and_replay(plugin_id, callback.as_ref());
            debug!(plugin_id, replayed, "replayed buffered deltas");
        }

        if let Err(e) = outcome {
            let detail = e.to_string();
            let message = if recovering {
                format!("Failed to recover from crash: {detail}")
            } else {
                format!("Reload failed: {detail}")
            };
            services.plugins.update(plugin_id, |plugin| {
                plugin.status = PluginStatus::Error;
                plugin.error_message = Some(message.clone());
                plugin.instance = self.inner.runtime.get(plugin_id);
            });
            services.app.set_plugin_error(plugin_id, &message);
            error!(plugin_id, error = %message, "plugin reload failed");
            return Err(PluginError::ReloadFailure(detail));
        }
        Ok(())
    }

    async fn swap_instance(&self, plugin_id: &str, was_running: bool, recovering: bool) -> PluginResult<()> {
        if was_running {
            self.stop(plugin_id).await?;
        }

        let host = self.clone();
        let id = plugin_id.to_string();
        let fresh = run_blocking(move || host.inner.runtime.reload(&id)).await?;

        let record = self.record(plugin_id)?;
        {
            let mut plugin = lock(&record);
            if !fresh.identity().name.is_empty() {
                plugin.name = fresh.identity().name.clone();
            }
            plugin.schema = fresh.identity().schema.clone();
            plugin.instance = Some(fresh);
        }
        self.install_routes(plugin_id);

        if was_running {
            self.start_internal(plugin_id, recovering).await?;
        }
        Ok(())
    }

    /// Record a crash of a running plugin and schedule recovery
    pub fn handle_crash(&self, plugin_id: &str, message: &str) {
        let Some(record) = self.inner.services.plugins.get(plugin_id) else {
            return;
        };
        {
            let plugin = lock(&record);
            if plugin.status != PluginStatus::Running {
                debug!(plugin_id, status = %plugin.status, "ignoring crash report, plugin not running");
                return;
            }
        }
        self.unwire(plugin_id);

        let (crash_count, backoff) = {
            let mut plugin = lock(&record);
            let now = Instant::now();
            if plugin
                .last_crash_at
                .is_some_and(|at| now.duration_since(at) >= CRASH_COUNT_WINDOW)
            {
                debug!(plugin_id, previous = plugin.crash_count, "crash streak expired, resetting count");
                plugin.crash_count = 0;
                plugin.restart_backoff = RESTART_BACKOFF_FLOOR;
            }
            plugin.crash_count += 1;
            plugin.last_crash = Some(Utc::now());
            plugin.last_crash_at = Some(now);
            if plugin.crash_count >= MAX_CRASHES {
                plugin.status = PluginStatus::Error;
                plugin.error_message = Some(CRASH_LIMIT_MESSAGE.to_string());
            } else {
                plugin.status = PluginStatus::Crashed;
                plugin.error_message = Some(message.to_string());
                plugin.restart_backoff = next_backoff(plugin.restart_backoff);
            }
            (plugin.crash_count, plugin.restart_backoff)
        };

        let app = &self.inner.services.app;
        if crash_count >= MAX_CRASHES {
            self.cancel_restart_timer(plugin_id);
            app.set_plugin_error(plugin_id, CRASH_LIMIT_MESSAGE);
            error!(plugin_id, crash_count, error = %message, "plugin crashed too often, giving up");
            return;
        }

        warn!(
            plugin_id,
            crash_count,
            backoff_ms = backoff.as_millis() as u64,
            error = %message,
            "plugin crashed, scheduling restart"
        );
        app.set_plugin_error(plugin_id, &format!("Plugin crashed: {message}"));

        let weak = self.downgrade();
        let id = plugin_id.to_string();
        let mut timers = lock(&self.inner.restart_timers);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let Some(host) = PluginHost::from_weak(&weak) else {
                return;
            };
            // detach before reloading so stop() does not abort this task
            lock(&host.inner.restart_timers).remove(&id);
            if let Err(e) = host.reload_with(&id, true).await {
                warn!(plugin_id = %id, error = %e, "crash recovery failed");
            }
        });
        if let Some(previous) = timers.insert(plugin_id.to_string(), timer) {
            previous.abort();
        }
    }

    /// Drop a pending crash-recovery restart; true if one was pending
    pub fn cancel_restart_timer(&self, plugin_id: &str) -> bool {
        match lock(&self.inner.restart_timers).remove(plugin_id) {
            Some(timer) => {
                timer.abort();
                debug!(plugin_id, "cancelled pending restart");
                true
            }
            None => false,
        }
    }

    pub fn has_pending_restart(&self, plugin_id: &str) -> bool {
        lock(&self.inner.restart_timers).contains_key(plugin_id)
    }

    /// Stop everything and reset host state so it can be used again
    pub async fn shutdown_all(&self) {
        for (_, timer) in lock(&self.inner.restart_timers).drain() {
            timer.abort();
        }

        let services = self.inner.services.clone();
        for plugin_id in services.plugins.ids() {
            let active = services.plugins.get(&plugin_id).is_some_and(|record| {
                matches!(
                    lock(&record).status,
                    PluginStatus::Running | PluginStatus::Starting | PluginStatus::Crashed
                )
            });
            if active {
                if let Err(e) = self.stop(&plugin_id).await {
                    warn!(plugin_id = %plugin_id, error = %e, "stop during shutdown failed");
                }
            }
        }

        for (_, wiring) in lock(&self.inner.wiring).drain() {
            wiring.abort();
        }

        let host = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || host.inner.runtime.shutdown()).await {
            warn!(error = %e, "runtime shutdown task failed");
        }

        self.inner.routes.clear();
        lock(&self.inner.webapps).clear();
        for record in services.plugins.clear() {
            lock(&record).instance = None;
        }
        services.events.clear();
        services.deltas.clear();
        services.sockets.clear();
        services.tcp.clear();
        services.puts.clear();
        info!("plugin host shut down");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod lifecycle_tests;
