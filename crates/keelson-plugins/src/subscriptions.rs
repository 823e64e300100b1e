//! Delta fan-out to plugins by path pattern

use keelson_core::model::Delta;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const MAX_BUFFERED_DELTAS: usize = 1000;

/// Pattern that matches every path
pub const ALL_PATHS: &str = "*";

pub type DeltaCallback = Arc<dyn Fn(&Delta) + Send + Sync>;

/// Glob match where `*` spans any run of characters, dots included.
/// Everything else is literal and the whole path must match.
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    if pattern == ALL_PATHS {
        return true;
    }
    let (p, t): (Vec<char>, Vec<char>) = (pattern.chars().collect(), path.chars().collect());
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

fn delta_matches(delta: &Delta, patterns: &[String]) -> bool {
    delta
        .paths()
        .any(|path| patterns.iter().any(|pattern| matches_pattern(path, pattern)))
}

struct Subscription {
    patterns: Vec<String>,
    callback: DeltaCallback,
}

struct BufferWindow {
    patterns: Vec<String>,
    queue: VecDeque<Delta>,
}

#[derive(Default)]
struct DeltaState {
    subscriptions: HashMap<String, Subscription>,
    buffering: HashMap<String, BufferWindow>,
}

#[derive(Default)]
pub struct DeltaSubscriptionManager {
    state: Mutex<DeltaState>,
}

impl DeltaSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeltaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, plugin_id: &str, patterns: Vec<String>, callback: DeltaCallback) {
        debug!(plugin_id, patterns = ?patterns, "registered delta subscription");
        self.state().subscriptions.insert(
            plugin_id.to_string(),
            Subscription { patterns, callback },
        );
    }

    pub fn unsubscribe(&self, plugin_id: &str) {
        if self.state().subscriptions.remove(plugin_id).is_some() {
            debug!(plugin_id, "unregistered delta subscription");
        }
    }

    pub fn is_subscribed(&self, plugin_id: &str) -> bool {
        self.state().subscriptions.contains_key(plugin_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Deliver a delta to each matching plugin once, or queue it for
    /// plugins inside a reload window.
    pub fn route(&self, delta: &Delta) {
        let deliveries: Vec<DeltaCallback> = {
            let mut state = self.state();
            for (plugin_id, window) in state.buffering.iter_mut() {
                if delta_matches(delta, &window.patterns) {
                    window.queue.push_back(delta.clone());
                    if window.queue.len() > MAX_BUFFERED_DELTAS {
                        window.queue.pop_front();
                        debug!(plugin_id = %plugin_id, "delta buffer overflow, dropped oldest");
                    }
                }
            }
            state
                .subscriptions
                .iter()
                .filter(|(id, _)| !state.buffering.contains_key(*id))
                .filter(|(_, sub)| delta_matches(delta, &sub.patterns))
                .map(|(_, sub)| sub.callback.clone())
                .collect()
        };

        for callback in deliveries {
            callback(delta);
        }
    }

    pub fn start_buffering(&self, plugin_id: &str) {
        let mut state = self.state();
        let patterns = state
            .subscriptions
            .get(plugin_id)
            .map(|s| s.patterns.clone())
            .unwrap_or_else(|| vec![ALL_PATHS.to_string()]);
        state.buffering.insert(
            plugin_id.to_string(),
            BufferWindow {
                patterns,
                queue: VecDeque::new(),
            },
        );
        debug!(plugin_id, "started buffering deltas");
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

    /// Drain the backlog in order, then return the plugin to live routing
    pub fn stop_buffering_and_replay(&self, plugin_id: &str, callback: Option<&DeltaCallback>) -> usize {
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
            let Some(delta) = next else { break };
            if let Some(callback) = callback {
                callback(&delta);
                replayed += 1;
            }
        }
        debug!(plugin_id, replayed, "stopped buffering deltas");
        replayed
    }

    pub fn remove_plugin(&self, plugin_id: &str) {
        let mut state = self.state();
        state.subscriptions.remove(plugin_id);
        state.buffering.remove(plugin_id);
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.subscriptions.clear();
        state.buffering.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(paths: &[&str]) -> Delta {
        let mut d = Delta::single(Some("vessels.self"), paths[0], json!(1));
        for path in &paths[1..] {
            d.updates[0].values.push(keelson_core::model::PathValue {
                path: path.to_string(),
                value: json!(2),
            });
        }
        d
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("navigation.speedOverGround", "*"));
        assert!(matches_pattern("navigation.speedOverGround", "navigation.*"));
        assert!(matches_pattern("navigation.position", "navigation.position"));
        assert!(matches_pattern("electrical.batteries.1.voltage", "electrical.*.voltage"));
        assert!(!matches_pattern("navigationXspeed", "navigation.speed"));
        assert!(!matches_pattern("environment.depth", "navigation.*"));
        assert!(!matches_pattern("navigation.position.latitude", "navigation.position"));
    }

    #[test]
    fn test_callback_invoked_once_per_delta() {
        let manager = DeltaSubscriptionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.subscribe(
            "p",
            vec!["navigation.*".to_string(), "*".to_string()],
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.route(&delta(&["navigation.speedOverGround", "navigation.headingTrue"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_matching_delta_not_delivered() {
        let manager = DeltaSubscriptionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.subscribe(
            "p",
            vec!["environment.*".to_string()],
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager.route(&delta(&["navigation.speedOverGround"]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_buffered_deltas_replay_in_order() {
        let manager = DeltaSubscriptionManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: DeltaCallback = Arc::new(move |d: &Delta| {
            sink.lock()
                .expect("lock")
                .push(d.paths().next().unwrap_or_default().to_string());
        });
        manager.subscribe("p", vec!["*".to_string()], callback.clone());

        manager.start_buffering("p");
        manager.route(&delta(&["a.one"]));
        manager.route(&delta(&["a.two"]));
        assert!(seen.lock().expect("lock").is_empty());

        assert_eq!(manager.stop_buffering_and_replay("p", Some(&callback)), 2);
        manager.route(&delta(&["a.three"]));
        assert_eq!(*seen.lock().expect("lock"), vec!["a.one", "a.two", "a.three"]);
    }

    #[test]
    fn test_delta_buffer_is_bounded() {
        let manager = DeltaSubscriptionManager::new();
        manager.start_buffering("p");
        for _ in 0..(MAX_BUFFERED_DELTAS + 10) {
            manager.route(&delta(&["a.b"]));
        }
        assert_eq!(manager.buffered_len("p"), MAX_BUFFERED_DELTAS);
        assert_eq!(manager.stop_buffering_and_replay("p", None), 0);
        assert!(!manager.is_buffering("p"));
    }
}
