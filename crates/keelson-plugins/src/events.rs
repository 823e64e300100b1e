//! Server event fan-out to plugins
//!
//! Only allow-listed event names reach plugins. Anything else is dropped at
//! the router without an error. While a plugin is being reloaded its events
//! are queued and replayed in order once the new instance is live.

use keelson_core::model::ServerEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Uppercase server lifecycle/telemetry events
pub const SERVER_EVENT_TYPES: &[&str] = &[
    "SERVERSTATISTICS",
    "VESSEL_INFO",
    "DEBUG_SETTINGS",
    "SERVERMESSAGE",
    "PROVIDERSTATUS",
    "SOURCEPRIORITIES",
];

/// Lowercase protocol-stream events
pub const GENERIC_EVENT_TYPES: &[&str] = &[
    "nmea0183",
    "nmea0183out",
    "nmea2000JsonOut",
    "nmea2000out",
    "nmea2000OutAvailable",
    "canboatjs:error",
    "canboatjs:warning",
    "canboatjs:unparsed:data",
];

/// Prefix reserved for plugin-to-plugin signaling
pub const PLUGIN_EVENT_PREFIX: &str = "PLUGIN_";

pub const MAX_BUFFERED_EVENTS: usize = 100;

pub fn is_allowed_event(event_type: &str) -> bool {
    event_type.starts_with(PLUGIN_EVENT_PREFIX)
        || SERVER_EVENT_TYPES.contains(&event_type)
        || GENERIC_EVENT_TYPES.contains(&event_type)
}

pub fn allowed_event_types() -> Vec<&'static str> {
    SERVER_EVENT_TYPES
        .iter()
        .chain(GENERIC_EVENT_TYPES.iter())
        .copied()
        .collect()
}

/// Keep only allowed names; an empty list means every allowed event
pub fn normalize_filter(event_types: &[String]) -> Vec<String> {
    event_types
        .iter()
        .filter(|t| is_allowed_event(t))
        .cloned()
        .collect()
}

fn filter_matches(filter: &[String], event_type: &str) -> bool {
    filter.is_empty() || filter.iter().any(|t| t == event_type)
}

pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

struct Subscription {
    event_types: Vec<String>,
    callback: EventCallback,
}

struct BufferWindow {
    event_types: Vec<String>,
    queue: VecDeque<ServerEvent>,
}

#[derive(Default)]
struct EventState {
    subscriptions: HashMap<String, Subscription>,
    requested: HashMap<String, Vec<String>>,
    buffering: HashMap<String, BufferWindow>,
}

#[derive(Default)]
pub struct EventManager {
    state: Mutex<EventState>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember the filter a plugin asked for from inside its start export
    pub fn request_filter(&self, plugin_id: &str, event_types: &[String]) -> Vec<String> {
        let filter = normalize_filter(event_types);
        self.state()
            .requested
            .insert(plugin_id.to_string(), filter.clone());
        debug!(plugin_id, filter = ?filter, "plugin requested event filter");
        filter
    }

    pub fn requested_filter(&self, plugin_id: &str) -> Vec<String> {
        self.state()
            .requested
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Register (or replace) the plugin's subscription
    pub fn subscribe(&self, plugin_id: &str, event_types: &[String], callback: EventCallback) {
        let event_types = normalize_filter(event_types);
        debug!(plugin_id, filter = ?event_types, "registered event subscription");
        self.state().subscriptions.insert(
            plugin_id.to_string(),
            Subscription {
                event_types,
                callback,
            },
        );
    }

    pub fn unsubscribe(&self, plugin_id: &str) {
        if self.state().subscriptions.remove(plugin_id).is_some() {
            debug!(plugin_id, "unregistered event subscription");
        }
    }

    pub fn is_subscribed(&self, plugin_id: &str) -> bool {
        self.state().subscriptions.contains_key(plugin_id)
    }

    pub fn subscription_filter(&self, plugin_id: &str) -> Option<Vec<String>> {
        self.state()
            .subscriptions
            .get(plugin_id)
            .map(|s| s.event_types.clone())
    }

    /// Change the filter of a live subscription, keeping its callback
    pub fn update_filter(&self, plugin_id: &str, event_types: &[String]) -> bool {
        let filter = normalize_filter(event_types);
        let mut state = self.state();
        match state.subscriptions.get_mut(plugin_id) {
            Some(sub) => {
                sub.event_types = filter;
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every matching plugin, or queue it for plugins
    /// that are mid-reload. Disallowed events are dropped.
    pub fn route(&self, event: &ServerEvent) {
        if !is_allowed_event(&event.event_type) {
            debug!(event_type = %event.event_type, "event type not allowed for plugins, dropped");
            return;
        }

        let mut event = event.clone();
        if event.timestamp.is_none() {
            event.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }

        let deliveries: Vec<EventCallback> = {
            let mut state = self.state();
            for (plugin_id, window) in state.buffering.iter_mut() {
                if filter_matches(&window.event_types, &event.event_type) {
                    window.queue.push_back(event.clone());
                    if window.queue.len() > MAX_BUFFERED_EVENTS {
                        window.queue.pop_front();
                        debug!(plugin_id = %plugin_id, "event buffer overflow, dropped oldest");
                    }
                }
            }
            state
                .subscriptions
                .iter()
                .filter(|(id, _)| !state.buffering.contains_key(*id))
                .filter(|(_, sub)| filter_matches(&sub.event_types, &event.event_type))
                .map(|(_, sub)| sub.callback.clone())
                .collect()
        };

        for callback in deliveries {
            callback(&event);
        }
    }

    /// Begin queuing events for a plugin about to be reloaded
    pub fn start_buffering(&self, plugin_id: &str) {
        let mut state = self.state();
        let event_types = state
            .subscriptions
            .get(plugin_id)
            .map(|s| s.event_types.clone())
            .or_else(|| state.requested.get(plugin_id).cloned())
            .unwrap_or_default();
        state.buffering.insert(
            plugin_id.to_string(),
            BufferWindow {
                event_types,
                queue: VecDeque::new(),
            },
        );
        debug!(plugin_id, "started buffering events");
    }

    pub fn is_buffering(&self, plugin_id: &str) -> bool {
        self.state().buffering.contains_key(plugin_id)
    }

    pub fn buffered_len(&self, plugin_id: &str) -> usize {
        self.state()
            .buffering
            .get(plugin_id)
            .map_or(0, |w| w.queue.len())
    }

    /// Replay queued events in order, then switch the plugin back to live routing.
    ///
    /// The window stays open while draining, so events routed meanwhile are
    /// appended behind the backlog instead of overtaking it. The switch to
    /// live happens under the lock once the queue is empty.
    pub fn stop_buffering_and_replay(&self, plugin_id: &str, callback: Option<&EventCallback>) -> usize {
        let mut replayed = 0;
        loop {
            let next = {
                let mut state = self.state();
                let popped = state
                    .buffering
                    .get_mut(plugin_id)
                    .and_then(|w| w.queue.pop_front());
                if popped.is_none() {
                    state.buffering.remove(plugin_id);
                }
                popped
            };
            match next {
                Some(event) => {
                    if let Some(callback) = callback {
                        callback(&event);
                        replayed += 1;
                    }
                }
                None => break,
            }
        }
        debug!(plugin_id, replayed, "stopped buffering events");
        replayed
    }

    /// Forget everything about one plugin
    pub fn remove_plugin(&self, plugin_id: &str) {
        let mut state = self.state();
        state.subscriptions.remove(plugin_id);
        state.requested.remove(plugin_id);
        state.buffering.remove(plugin_id);
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.subscriptions.clear();
        state.requested.clear();
        state.buffering.clear();
        debug!("cleared all event subscriptions and buffers");
    }
}
