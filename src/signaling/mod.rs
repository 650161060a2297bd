//! Signaling Module - Realtime Keyed Store
//!
//! Dieses Modul kapselt den Kanal, über den zwei Parteien ihre
//! Signaling-Records austauschen:
//! - `RealtimeChannel`: hierarchischer Key-Value-Store mit Child-/Value-Notifications
//! - `MemoryChannel`: In-Process-Implementierung (Tests, Loopback)
//! - `WsChannel`: WebSocket-Client für den Relay-Server
//!

mod client;
mod memory;
mod messages;

pub use client::{ConnectionEvent, WsChannel, WsChannelConfig};
pub use memory::MemoryChannel;
pub use messages::*;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Invalid channel path: {0}")]
    InvalidPath(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Write timed out")]
    Timeout,

    #[error("Server rejected request: {code} - {message}")]
    Rejected { code: i32, message: String },
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Notification eines Kanals an einen Subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Child existiert (bei Subscription bereits vorhanden oder neu)
    ChildAdded { key: String, value: Value },
    /// Child wurde entfernt
    ChildRemoved { key: String, value: Value },
    /// Aktueller Wert eines Knotens (`None` = existiert nicht)
    Value(Option<Value>),
}

/// Callback, der Notifications entgegennimmt.
///
/// Sinks werden vom Kanal synchron aufgerufen und dürfen weder blockieren
/// noch zurück in den Kanal schreiben.
pub type ChannelSink = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

// ============================================================================
// SUBSCRIPTION HANDLE
// ============================================================================

/// Handle einer laufenden Subscription
///
/// Beim Drop (oder `cancel()`) wird die Subscription beendet.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Beendet die Subscription sofort
    pub fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.lock().is_some())
            .finish()
    }
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Hierarchischer Store mit Notifications.
///
/// Keine atomaren Multi-Path-Writes, keine Ordnung zwischen Writes auf
/// verschiedene Pfade. `remove` ist das einzige Signal für "existiert nicht mehr".
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Ersetzt den Knoten unter `path`
    async fn write(&self, path: &str, value: Value) -> Result<(), ChannelError>;

    /// Merged die Felder von `partial` in den Knoten unter `path`
    async fn update(&self, path: &str, partial: Value) -> Result<(), ChannelError>;

    /// Löscht den Knoten samt Children
    async fn remove(&self, path: &str) -> Result<(), ChannelError>;

    /// Hängt `value` unter einem neuen, zeitlich sortierten Key an
    async fn push(&self, path: &str, value: Value) -> Result<String, ChannelError> {
        let key = push_id();
        self.write(&child_path(path, &key), value).await?;
        Ok(key)
    }

    /// Child-Notifications (`ChildAdded` auch für bereits existierende Children)
    fn subscribe(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError>;

    /// Value-Notifications (einmal sofort, danach bei jeder Änderung)
    fn subscribe_value(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError>;
}

// ============================================================================
// PATH HELPERS
// ============================================================================

/// Zerlegt und validiert einen Pfad
pub fn split_path(path: &str) -> Result<Vec<String>, ChannelError> {
    let segments: Vec<String> = path
        .trim_matches('/')
        .split('/')
        .map(str::to_string)
        .collect();

    let invalid = segments.iter().any(|s| {
        s.is_empty() || s.contains(|c| matches!(c, '.' | '#' | '$' | '[' | ']'))
    });
    if invalid {
        return Err(ChannelError::InvalidPath(path.to_string()));
    }

    Ok(segments)
}

/// Verbindet Pfad und Child-Key
pub fn child_path(path: &str, key: &str) -> String {
    format!("{}/{}", path.trim_end_matches('/'), key)
}

const PUSH_CHARS: &[u8] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

static PUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Erzeugt einen Push-Key: 8 Zeichen Zeitstempel + 12 Zeichen Zähler/Zufall.
///
/// Lexikographische Ordnung entspricht der Erzeugungsreihenfolge innerhalb
/// eines Prozesses.
pub fn push_id() -> String {
    use rand::Rng;

    let mut id = String::with_capacity(20);

    let mut now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut time_chars = [0u8; 8];
    for slot in time_chars.iter_mut().rev() {
        *slot = PUSH_CHARS[(now % 64) as usize];
        now /= 64;
    }
    id.extend(time_chars.iter().map(|&b| b as char));

    let mut counter = PUSH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut counter_chars = [0u8; 6];
    for slot in counter_chars.iter_mut().rev() {
        *slot = PUSH_CHARS[(counter % 64) as usize];
        counter /= 64;
    }
    id.extend(counter_chars.iter().map(|&b| b as char));

    let mut rng = rand::thread_rng();
    id.extend((0..6).map(|_| PUSH_CHARS[rng.gen_range(0..64)] as char));

    id
}

// ============================================================================
// TESTS
// ============================================================================
