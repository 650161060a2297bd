//! WebSocket Client für den Relay-Server
//!
//! Implementiert `RealtimeChannel` gegen einen Relay, der den Keyed Store hält:
//! - Handshake mit Ed25519-Identität
//! - Signierte Mutationen mit Ack/Timeout
//! - Subscriptions mit serverseitigen Notifications
//! - Heartbeat-Keeping

use super::messages::*;
use super::{split_path, ChannelError, ChannelEvent, ChannelSink, RealtimeChannel, Subscription};
use crate::crypto::KeyPair;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CONFIG & EVENTS
// ============================================================================

/// Verbindungsparameter für den Relay
#[derive(Debug, Clone)]
pub struct WsChannelConfig {
    /// WebSocket-URL (`ws://` oder `wss://`)
    pub url: String,
    /// Eigene Party-ID
    pub party_id: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Events zum Verbindungsstatus
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { party_id: String },
    Disconnected,
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    party_id: Option<String>,
}

type PendingWrites = HashMap<u64, oneshot::Sender<Result<(), ChannelError>>>;

/// Zustand, den Read-Task und Channel teilen
struct Shared {
    state: RwLock<ClientState>,
    pending: Mutex<PendingWrites>,
    sinks: Mutex<HashMap<u64, ChannelSink>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn fail_pending(&self) {
        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err(ChannelError::NotConnected));
        }
    }

    fn mark_disconnected(&self) {
        let was_connected = std::mem::take(&mut self.state.write().is_connected);
        self.fail_pending();
        if was_connected {
            let _ = self.event_tx.send(ConnectionEvent::Disconnected);
        }
    }
}

// ============================================================================
// WEBSOCKET CHANNEL
// ============================================================================

/// `RealtimeChannel` über eine WebSocket-Verbindung zum Relay
pub struct WsChannel {
    config: WsChannelConfig,
    keypair: Arc<KeyPair>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<String>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsChannel {
    /// Verbindet mit dem Relay und meldet die Party an
    pub async fn connect(
        config: WsChannelConfig,
        keypair: Arc<KeyPair>,
    ) -> Result<Arc<Self>, ChannelError> {
        tracing::info!("Connecting to signaling relay: {}", config.url);

        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(100);

        let shared = Arc::new(Shared {
            state: RwLock::new(ClientState {
                is_connected: true,
                party_id: None,
            }),
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            event_tx,
        });

        // Channel für die Welcome-Response
        let (welcome_tx, mut welcome_rx) = mpsc::channel::<Result<String, ChannelError>>(1);

        // Read-Task
        let read_shared = Arc::clone(&shared);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &read_shared, &welcome_tx).await
                        }
                        Err(e) => tracing::warn!("Unparseable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            read_shared.mark_disconnected();
        });

        // Write-Task
        let write_shared = Arc::downgrade(&shared);
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    if let Some(shared) = write_shared.upgrade() {
                        shared.mark_disconnected();
                    }
                    break;
                }
            }
            let _ = write.close().await;
        });

        let channel = Arc::new(Self {
            config,
            keypair,
            shared,
            tx,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(vec![read_task, write_task]),
        });

        // Anmeldung senden und auf Welcome warten
        let hello = ClientMessage::Hello {
            party_id: channel.config.party_id.clone(),
            public_key: channel.keypair.public_key_base64(),
        };
        channel.send(&hello).await?;

        let welcome = tokio::select! {
            result = welcome_rx.recv() => result.unwrap_or_else(|| {
                Err(ChannelError::ConnectionFailed("No welcome".to_string()))
            }),
            _ = tokio::time::sleep(channel.config.connect_timeout) => {
                Err(ChannelError::ConnectionFailed("Timeout".to_string()))
            }
        };

        let party_id = match welcome {
            Ok(party_id) => party_id,
            Err(e) => {
                channel.disconnect();
                return Err(e);
            }
        };

        channel.shared.state.write().party_id = Some(party_id.clone());
        let _ = channel
            .shared
            .event_tx
            .send(ConnectionEvent::Connected { party_id });

        channel.start_heartbeat();

        Ok(channel)
    }

    /// Gibt einen Event-Receiver für den Verbindungsstatus zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Vom Relay bestätigte Party-ID
    pub fn party_id(&self) -> Option<String> {
        self.shared.state.read().party_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected
    }

    /// Trennt die Verbindung; offene Writes schlagen mit `NotConnected` fehl
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.mark_disconnected();
        self.shared.sinks.lock().clear();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sendet eine signierte Nachricht
    async fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let frame = sign_frame(&self.keypair, msg)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Sendet eine Mutation und wartet auf Ack oder Fehler
    async fn request(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        let Some(request_id) = msg.request_id() else {
            return self.send(&msg).await;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, reply_tx);

        if let Err(e) = self.send(&msg).await {
            self.shared.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.write_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                tracing::warn!("Relay did not acknowledge request {}", request_id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Meldet eine Subscription beim Relay an.
    ///
    /// Schlägt fehl, wenn das Subscribe-Frame nicht in die Sende-Queue passt
    /// (Queue voll oder Write-Task beendet).
    fn open_subscription(
        &self,
        path: &str,
        mode: SubscriptionMode,
        sink: ChannelSink,
    ) -> Result<Subscription, ChannelError> {
        split_path(path)?;
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let subscription_id = self.next_id();
        let subscribe = ClientMessage::Subscribe {
            subscription_id,
            path: path.to_string(),
            mode,
        };
        let frame = sign_frame(&self.keypair, &subscribe)?;

        self.shared.sinks.lock().insert(subscription_id, sink);
        // try_send ist non-blocking
        if let Err(e) = self.tx.try_send(frame) {
            tracing::error!("Failed to subscribe to {}: {}", path, e);
            self.shared.sinks.lock().remove(&subscription_id);
            return Err(ChannelError::WriteFailed(e.to_string()));
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let keypair = Arc::clone(&self.keypair);
        let tx = self.tx.clone();
        Ok(Subscription::new(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.sinks.lock().remove(&subscription_id);
            if !shared.state.read().is_connected {
                return;
            }
            let unsubscribe = ClientMessage::Unsubscribe { subscription_id };
            if let Ok(frame) = sign_frame(&keypair, &unsubscribe) {
                let _ = tx.try_send(frame);
            }
        }))
    }

    /// Startet den Heartbeat-Task
    fn start_heartbeat(&self) {
        let shared = Arc::downgrade(&self.shared);
        let keypair = Arc::clone(&self.keypair);
        let tx = self.tx.clone();
        let party_id = self.config.party_id.clone();
        let period = self.config.heartbeat_interval;
        if period.is_zero() {
            return;
        }

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let connected = shared
                    .upgrade()
                    .map(|s| s.state.read().is_connected)
                    .unwrap_or(false);
                if !connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                let heartbeat = ClientMessage::Heartbeat {
                    party_id: party_id.clone(),
                };
                match sign_frame(&keypair, &heartbeat) {
                    Ok(frame) => {
                        if let Err(e) = tx.send(frame).await {
                            tracing::warn!("Failed to send heartbeat: {}", e);
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to sign heartbeat: {}", e),
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        shared: &Arc<Shared>,
        welcome_tx: &mpsc::Sender<Result<String, ChannelError>>,
    ) {
        match msg {
            ServerMessage::Welcome { party_id, .. } => {
                tracing::info!("Relay accepted party {}", party_id);
                let _ = welcome_tx.send(Ok(party_id)).await;
            }

            ServerMessage::Ack { request_id, .. } => {
                if let Some(reply) = shared.pending.lock().remove(&request_id) {
                    let _ = reply.send(Ok(()));
                }
            }

            ServerMessage::ChildAdded {
                subscription_id,
                key,
                value,
                ..
            } => Self::deliver(shared, subscription_id, ChannelEvent::ChildAdded { key, value }),

            ServerMessage::ChildRemoved {
                subscription_id,
                key,
                value,
                ..
            } => Self::deliver(
                shared,
                subscription_id,
                ChannelEvent::ChildRemoved { key, value },
            ),

            ServerMessage::Value {
                subscription_id,
                value,
                ..
            } => Self::deliver(shared, subscription_id, ChannelEvent::Value(value)),

            ServerMessage::Error {
                request_id,
                code,
                message,
                ..
            } => {
                tracing::error!("Relay error {}: {}", code, message);
                let error = ChannelError::Rejected {
                    code,
                    message: message.clone(),
                };
                match request_id.and_then(|id| shared.pending.lock().remove(&id)) {
                    Some(reply) => {
                        let _ = reply.send(Err(error));
                    }
                    None => {
                        // Fehler ohne Request gehört ggf. zum Handshake
                        let _ = welcome_tx.try_send(Err(error));
                    }
                }
                let _ = shared.event_tx.send(ConnectionEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    fn deliver(shared: &Arc<Shared>, subscription_id: u64, event: ChannelEvent) {
        let sink = shared.sinks.lock().get(&subscription_id).cloned();
        match sink {
            Some(sink) => sink(event),
            None => tracing::debug!("Notification for unknown subscription {}", subscription_id),
        }
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn write(&self, path: &str, value: Value) -> Result<(), ChannelError> {
        split_path(path)?;
        self.request(ClientMessage::Set {
            request_id: self.next_id(),
            path: path.to_string(),
            value,
        })
        .await
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), ChannelError> {
        split_path(path)?;
        if !partial.is_object() {
            return Err(ChannelError::WriteFailed(
                "update requires an object".to_string(),
            ));
        }
        self.request(ClientMessage::Update {
            request_id: self.next_id(),
            path: path.to_string(),
            value: partial,
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<(), ChannelError> {
        split_path(path)?;
        self.request(ClientMessage::Remove {
            request_id: self.next_id(),
            path: path.to_string(),
        })
        .await
    }

    fn subscribe(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        self.open_subscription(path, SubscriptionMode::Children, sink)
    }

    fn subscribe_value(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        self.open_subscription(path, SubscriptionMode::Value, sink)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("url", &self.config.url)
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

/// Serialisiert eine Nachricht mit Timestamp und Signatur
fn sign_frame(keypair: &KeyPair, msg: &ClientMessage) -> Result<String, ChannelError> {
    let mut frame =
        serde_json::to_value(msg).map_err(|e| ChannelError::WriteFailed(e.to_string()))?;

    let Some(fields) = frame.as_object_mut() else {
        return Err(ChannelError::WriteFailed("frame is not an object".to_string()));
    };
    fields.insert(
        "timestamp".to_string(),
        Value::Number(Utc::now().timestamp_millis().into()),
    );

    let signature = keypair.sign_message(&frame);
    if let Some(fields) = frame.as_object_mut() {
        fields.insert("signature".to_string(), Value::String(signature));
    }

    serde_json::to_string(&frame).map_err(|e| ChannelError::WriteFailed(e.to_string()))
}
