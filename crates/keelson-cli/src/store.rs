//! In-memory data model the CLI server hands to the plugin host

use keelson_core::model::{Delta, ServerEvent, SkVersion};
use keelson_plugins::ServerApp;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SELF_CONTEXT: &str = "vessels.self";

/// Traffic plugins produce that has to be fanned back out to the host
#[derive(Debug)]
pub enum Feed {
    Delta(Delta),
    Event(ServerEvent),
}

/// Latest value per full path (`<context>.<path>`)
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    feed: mpsc::UnboundedSender<Feed>,
}

impl MemoryStore {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Feed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                values: RwLock::new(BTreeMap::new()),
                feed: tx,
            },
            rx,
        )
    }

    /// Apply a delta to the stored values
    pub fn apply(&self, delta: &Delta) {
        let context = delta.context.as_deref().unwrap_or(SELF_CONTEXT);
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for update in &delta.updates {
            for pv in &update.values {
                values.insert(format!("{context}.{}", pv.path), pv.value.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lookup(&self, full_path: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(full_path)
            .cloned()
    }
}

impl ServerApp for MemoryStore {
    fn handle_message(&self, plugin_id: &str, delta: Delta, version: SkVersion) {
        debug!(plugin_id, ?version, "delta from plugin");
        self.apply(&delta);
        if self.feed.send(Feed::Delta(delta)).is_err() {
            warn!(plugin_id, "delta feed closed, not routing to subscribers");
        }
    }

    fn get_self_path(&self, path: &str) -> Option<Value> {
        self.lookup(&format!("{SELF_CONTEXT}.{path}"))
    }

    fn get_path(&self, path: &str) -> Option<Value> {
        self.lookup(path)
    }

    fn set_plugin_status(&self, plugin_id: &str, message: &str) {
        info!(plugin_id, message, "plugin status");
    }

    fn set_plugin_error(&self, plugin_id: &str, message: &str) {
        warn!(plugin_id, message, "plugin error");
    }

    fn emit_event(&self, event: &ServerEvent) {
        if self.feed.send(Feed::Event(event.clone())).is_err() {
            warn!(event_type = %event.event_type, "event feed closed");
        }
    }
}
