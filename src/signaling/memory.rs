//! In-Memory Realtime Channel
//!
//! Hierarchischer JSON-Baum mit Child- und Value-Subscriptions.
//! Wird für Tests und lokale Loopback-Setups verwendet; die Semantik
//! entspricht dem Relay (leere Knoten existieren nicht, `ChildAdded`
//! feuert auch für bereits vorhandene Children).

use super::{split_path, ChannelError, ChannelEvent, ChannelSink, RealtimeChannel, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};

// ============================================================================
// STORE STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchMode {
    Children,
    Value,
}

struct Watcher {
    id: u64,
    path: Vec<String>,
    mode: WatchMode,
    sink: ChannelSink,
}

struct StoreState {
    root: Value,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
            watchers: Vec::new(),
            next_watcher_id: 1,
        }
    }
}

// ============================================================================
// MEMORY CHANNEL
// ============================================================================

/// In-Process Implementierung von `RealtimeChannel`
///
/// Notifications werden synchron während der Schreiboperation zugestellt,
/// in der Reihenfolge der Mutationen.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Liest einen Snapshot des Knotens unter `path`
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = split_path(path).ok()?;
        let state = self.state.lock();
        node_at(&state.root, &segments).cloned()
    }

    /// Anzahl aktiver Subscriptions
    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    fn mutate<F>(&self, path: &str, op: F) -> Result<(), ChannelError>
    where
        F: FnOnce(&mut Value, &[String]),
    {
        let segments = split_path(path)?;
        let mut state = self.state.lock();

        let before: Vec<Option<Value>> = state
            .watchers
            .iter()
            .map(|w| node_at(&state.root, &w.path).cloned())
            .collect();

        op(&mut state.root, &segments);

        let mut deliveries = Vec::new();
        for (watcher, old) in state.watchers.iter().zip(before) {
            let new = node_at(&state.root, &watcher.path);
            for event in diff(watcher.mode, old.as_ref(), new) {
                deliveries.push((Arc::clone(&watcher.sink), event));
            }
        }

        // Zustellung unter Lock, damit die Reihenfolge den Mutationen entspricht
        for (sink, event) in deliveries {
            sink(event);
        }

        Ok(())
    }

    fn watch(
        &self,
        path: &str,
        mode: WatchMode,
        sink: ChannelSink,
    ) -> Result<Subscription, ChannelError> {
        let segments = split_path(path)?;

        let mut state = self.state.lock();
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;

        // Initiale Notifications
        let current = node_at(&state.root, &segments);
        for event in diff(mode, None, current) {
            sink(event);
        }
        if mode == WatchMode::Value && current.is_none() {
            sink(ChannelEvent::Value(None));
        }

        state.watchers.push(Watcher {
            id,
            path: segments,
            mode,
            sink,
        });

        let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().watchers.retain(|w| w.id != id);
            }
        }))
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn write(&self, path: &str, value: Value) -> Result<(), ChannelError> {
        self.mutate(path, |root, segments| set_node(root, segments, value))
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), ChannelError> {
        let Value::Object(fields) = partial else {
            return Err(ChannelError::WriteFailed(
                "update requires an object".to_string(),
            ));
        };

        self.mutate(path, |root, segments| {
            for (key, value) in fields {
                let mut child = segments.to_vec();
                child.push(key);
                set_node(root, &child, value);
            }
        })
    }

    async fn remove(&self, path: &str) -> Result<(), ChannelError> {
        self.mutate(path, |root, segments| set_node(root, segments, Value::Null))
    }

    fn subscribe(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        self.watch(path, WatchMode::Children, sink)
    }

    fn subscribe_value(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        self.watch(path, WatchMode::Value, sink)
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryChannel")
            .field("root", &state.root)
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

// ============================================================================
// TREE OPERATIONS
// ============================================================================

fn node_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Setzt (oder löscht bei `Null`) einen Knoten und entfernt leere Eltern
fn set_node(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    if value.is_null() || is_empty_object(&value) {
        remove_node(root, segments);
        return;
    }

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else {
            return;
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(map) = node.as_object_mut() {
        map.insert(last.clone(), value);
    }
}

fn remove_node(node: &mut Value, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    let Some(map) = node.as_object_mut() else {
        return false;
    };

    if rest.is_empty() {
        map.remove(first);
    } else if let Some(child) = map.get_mut(first) {
        remove_node(child, rest);
        if is_empty_object(child) {
            map.remove(first);
        }
    }

    map.is_empty()
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

/// Berechnet die Notifications zwischen zwei Zuständen eines Knotens
fn diff(mode: WatchMode, old: Option<&Value>, new: Option<&Value>) -> Vec<ChannelEvent> {
    match mode {
        WatchMode::Value => {
            if old == new {
                Vec::new()
            } else {
                vec![ChannelEvent::Value(new.cloned())]
            }
        }
        WatchMode::Children => {
            let empty = Map::new();
            let old_children = old.and_then(Value::as_object).unwrap_or(&empty);
            let new_children = new.and_then(Value::as_object).unwrap_or(&empty);

            let removed = old_children
                .iter()
                .filter(|(key, _)| !new_children.contains_key(*key))
                .map(|(key, value)| ChannelEvent::ChildRemoved {
                    key: key.clone(),
                    value: value.clone(),
                });
            let added = new_children
                .iter()
                .filter(|(key, _)| !old_children.contains_key(*key))
                .map(|(key, value)| ChannelEvent::ChildAdded {
                    key: key.clone(),
                    value: value.clone(),
                });

            removed.chain(added).collect()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
