//! Call Signaling Engine
//!
//! Steuert den Lebenszyklus eines Anrufs: Offer/Answer und ICE-Candidates
//! werden über den `RealtimeChannel` ausgetauscht, die `PeerSession` wird
//! entsprechend geführt und Lifecycle-Events gehen an die UI.
//!
//! Alle Kanal- und Peer-Notifications landen in einer einzigen Inbox und
//! werden nacheinander verarbeitet. Jede Session trägt eine Generation;
//! Notifications einer älteren Session werden verworfen. Nach jedem `await`
//! wird geprüft, ob die Session noch aktiv ist, andernfalls wird das eben
//! Erworbene sofort wieder freigegeben.

mod candidates;
mod resources;

use super::media::{LocalMedia, MediaError, MediaSource};
use super::peer::{
    PeerConnectionState, PeerError, PeerEvent, PeerSession, PeerSessionFactory, RemoteTrack,
};
use super::record::{call_record_path, inbox_path, CallRecord, SessionDescription};
use super::session::{CallKind, CallPhase, CallSession, Direction, EndReason, NegotiationRole};
use crate::signaling::{
    split_path, ChannelError, ChannelEvent, ChannelSink, RealtimeChannel, Subscription,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("No active call")]
    NoActiveSession,

    #[error("Already in a call")]
    SessionBusy,

    #[error("Signaling write failed: {0}")]
    ChannelWriteFailed(String),

    #[error("Negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("Peer unreachable")]
    PeerUnreachable,

    #[error("Call ended while the operation was in progress")]
    Cancelled,

    #[error("Invalid party id: {0:?}")]
    InvalidParty(String),
}

impl From<ChannelError> for CallError {
    fn from(error: ChannelError) -> Self {
        Self::ChannelWriteFailed(error.to_string())
    }
}

impl From<MediaError> for CallError {
    fn from(error: MediaError) -> Self {
        Self::MediaUnavailable(error.to_string())
    }
}

impl From<PeerError> for CallError {
    fn from(error: PeerError) -> Self {
        Self::NegotiationRejected(error.to_string())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der Engine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Neues Offer im eigenen Eingang
    IncomingCall {
        call_id: String,
        caller_id: String,
        caller_name: String,
        kind: CallKind,
    },
    /// Ausgehender Anruf wurde gestartet
    Dialing {
        call_id: String,
        remote_party_id: String,
        kind: CallKind,
    },
    /// Offer und Answer sind ausgetauscht
    Connecting { call_id: String },
    Connected { call_id: String },
    RemoteMedia { call_id: String, track: RemoteTrack },
    Ended { call_id: String, reason: EndReason },
}

/// Eingaben für die Inbox der Engine
enum EngineInput {
    /// Children von `calls/{me}`
    Inbox(ChannelEvent),
    /// Value des eigenen Call-Records (nur ausgehend)
    CallRecord { generation: u64, event: ChannelEvent },
    RemoteCandidate { generation: u64, event: ChannelEvent },
    Peer { generation: u64, event: PeerEvent },
    DisconnectGraceElapsed { generation: u64 },
    Barrier(oneshot::Sender<()>),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_party_id: String,
    /// Wird als `callerName` ins Offer geschrieben
    pub local_party_name: String,
    /// Offers während eines laufenden Anrufs entfernen statt ignorieren
    pub decline_when_busy: bool,
    /// Wartezeit nach `Disconnected`, bevor der Anruf endet
    pub disconnect_grace: Duration,
}

impl EngineConfig {
    pub fn new(local_party_id: impl Into<String>, local_party_name: impl Into<String>) -> Self {
        Self {
            local_party_id: local_party_id.into(),
            local_party_name: local_party_name.into(),
            decline_when_busy: true,
            disconnect_grace: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Aktive Session samt exklusiv gehaltenen Ressourcen
struct ActiveCall {
    session: CallSession,
    /// Offer des Callers (nur eingehend)
    incoming_offer: Option<SessionDescription>,
    peer: Option<Arc<dyn PeerSession>>,
    media: Option<Arc<dyn LocalMedia>>,
    subscriptions: Vec<Subscription>,
    /// Eigener Record wurde im Kanal gesehen (ausgehend)
    record_seen: bool,
    /// Remote Description angewendet und Queue geleert
    remote_ready: bool,
    /// Eigener Record geschrieben, lokale Candidates dürfen raus
    signaling_ready: bool,
    grace_timer: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession, incoming_offer: Option<SessionDescription>) -> Self {
        Self {
            session,
            incoming_offer,
            peer: None,
            media: None,
            subscriptions: Vec::new(),
            record_seen: false,
            remote_ready: false,
            signaling_ready: false,
            grace_timer: None,
        }
    }
}

#[derive(Default)]
struct EngineState {
    next_generation: u64,
    active: Option<ActiveCall>,
    inbox: Option<Subscription>,
}

struct EngineInner {
    config: EngineConfig,
    channel: Arc<dyn RealtimeChannel>,
    peers: Arc<dyn PeerSessionFactory>,
    media: Arc<dyn MediaSource>,
    state: Mutex<EngineState>,
    input_tx: mpsc::UnboundedSender<EngineInput>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL SIGNALING ENGINE
// ============================================================================

/// Zustandsmaschine für genau einen Anruf pro lokaler Party
#[derive(Clone)]
pub struct CallSignalingEngine {
    inner: Arc<EngineInner>,
}

impl CallSignalingEngine {
    /// Erstellt die Engine; muss innerhalb einer Tokio-Runtime aufgerufen werden
    pub fn new(
        config: EngineConfig,
        channel: Arc<dyn RealtimeChannel>,
        peers: Arc<dyn PeerSessionFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);

        let inner = Arc::new(EngineInner {
            config,
            channel,
            peers,
            media,
            state: Mutex::new(EngineState::default()),
            input_tx,
            event_tx,
        });

        tokio::spawn(run_inbox(Arc::downgrade(&inner), input_rx));

        Self { inner }
    }

    pub fn local_party_id(&self) -> &str {
        &self.inner.config.local_party_id
    }

    /// Beginnt auf eingehende Offers unter `calls/{me}` zu hören
    pub fn start(&self) -> Result<(), CallError> {
        if self.inner.state.lock().inbox.is_some() {
            return Ok(());
        }

        let tx = self.inner.input_tx.clone();
        let sink: ChannelSink = Arc::new(move |event| {
            let _ = tx.send(EngineInput::Inbox(event));
        });
        let path = inbox_path(&self.inner.config.local_party_id);
        let subscription = self.inner.channel.subscribe(&path, sink).map_err(|e| {
            tracing::error!("Failed to listen on {}: {}", path, e);
            CallError::from(e)
        })?;

        tracing::info!("Listening for incoming calls on {}", path);
        self.inner.state.lock().inbox = Some(subscription);
        Ok(())
    }

    /// Legt auf und beendet die Inbox-Subscription
    pub async fn shutdown(&self) {
        let inbox = self.inner.state.lock().inbox.take();
        drop(inbox);

        if self.hang_up().await.is_ok() {
            tracing::info!("Active call ended on shutdown");
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot der aktiven Session
    pub fn session(&self) -> Option<CallSession> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|call| call.session.clone())
    }

    /// Wartet, bis alle bisher eingegangenen Notifications verarbeitet sind
    pub async fn settle(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.input_tx.send(EngineInput::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    // ========================================================================
    // CALLER
    // ========================================================================

    /// Startet einen ausgehenden Anruf.
    ///
    /// Gibt die Session zurück, sobald das Offer im Kanal liegt.
    pub async fn place_call(
        &self,
        remote_party_id: &str,
        kind: CallKind,
    ) -> Result<CallSession, CallError> {
        let config = &self.inner.config;
        let valid_party = split_path(remote_party_id)
            .map(|segments| segments.len() == 1)
            .unwrap_or(false);
        if !valid_party || remote_party_id == config.local_party_id {
            return Err(CallError::InvalidParty(remote_party_id.to_string()));
        }

        let session = {
            let mut state = self.inner.state.lock();
            if state.active.is_some() {
                return Err(CallError::SessionBusy);
            }
            state.next_generation += 1;
            let session = CallSession::outgoing(
                state.next_generation,
                uuid::Uuid::new_v4().to_string(),
                &config.local_party_id,
                remote_party_id,
                kind,
            );
            state.active = Some(ActiveCall::new(session.clone(), None));
            session
        };
        let generation = session.generation();

        tracing::info!(
            "Placing {:?} call {} to {}",
            kind,
            session.call_id,
            remote_party_id
        );
        self.emit(CallEvent::Dialing {
            call_id: session.call_id.clone(),
            remote_party_id: remote_party_id.to_string(),
            kind,
        });

        let media = self.acquire_media(generation, kind).await?;
        let peer = self.create_peer(generation).await?;
        self.attach_tracks(generation, &peer, &media).await?;

        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.abort(generation, e.into()).await),
        };

        let subscriptions = match self.watch_outgoing(generation, &session) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!("Failed to watch call {}: {}", session.call_id, e);
                return Err(self.abort(generation, e.into()).await);
            }
        };
        self.with_call(generation, |call| {
            call.session.local_description = Some(offer.clone());
            call.subscriptions.extend(subscriptions);
        })
        .ok_or(CallError::Cancelled)?;

        let record = CallRecord::offer(
            &config.local_party_id,
            &config.local_party_name,
            kind.is_video(),
            &offer,
        );
        if let Err(e) = self
            .inner
            .channel
            .write(&session.channel_path, record.to_value())
            .await
        {
            tracing::error!("Failed to write offer for call {}: {}", session.call_id, e);
            return Err(self.abort(generation, e.into()).await);
        }
        if !self.is_current(generation) {
            self.remove_quietly(&session.channel_path).await;
            return Err(CallError::Cancelled);
        }
        tracing::debug!("Offer written to {}", session.channel_path);

        self.flush_local_candidates(generation).await?;
        self.snapshot(generation).ok_or(CallError::Cancelled)
    }

    /// Eigener Record (Answer, Auflegen) und Candidates des Callees
    fn watch_outgoing(
        &self,
        generation: u64,
        session: &CallSession,
    ) -> Result<Vec<Subscription>, ChannelError> {
        let record = self.inner.channel.subscribe_value(
            &session.channel_path,
            self.channel_sink(generation, |generation, event| EngineInput::CallRecord {
                generation,
                event,
            }),
        )?;
        let candidates = self.inner.channel.subscribe(
            &session.inbound_candidates_path(),
            self.channel_sink(generation, |generation, event| EngineInput::RemoteCandidate {
                generation,
                event,
            }),
        )?;
        Ok(vec![record, candidates])
    }

    // ========================================================================
    // CALLEE
    // ========================================================================

    /// Nimmt den klingelnden Anruf an.
    ///
    /// Ein inzwischen entfernter Offer-Record beendet die Session über
    /// `ChildRemoved` in der Inbox; jeder Schritt danach scheitert an der
    /// Generation. Ein Answer, das erst nach dem Entfernen geschrieben wurde,
    /// wird nach dem `is_current`-Check wieder gelöscht.
    pub async fn accept_call(&self) -> Result<CallSession, CallError> {
        let (session, offer) = {
            let mut state = self.inner.state.lock();
            let call = state.active.as_mut().ok_or(CallError::NoActiveSession)?;
            if !call.session.is_ringing() {
                return Err(CallError::SessionBusy);
            }
            call.session.phase = CallPhase::Negotiating(NegotiationRole::Answering);
            (call.session.clone(), call.incoming_offer.clone())
        };
        let generation = session.generation();

        tracing::info!(
            "Accepting call {} from {}",
            session.call_id,
            session.remote_party_id
        );

        let Some(offer) = offer else {
            let error = CallError::NegotiationRejected("missing offer".to_string());
            return Err(self.abort(generation, error).await);
        };

        let media = self.acquire_media(generation, session.kind).await?;
        let peer = self.create_peer(generation).await?;
        self.attach_tracks(generation, &peer, &media).await?;

        let subscription = match self.inner.channel.subscribe(
            &session.inbound_candidates_path(),
            self.channel_sink(generation, |generation, event| EngineInput::RemoteCandidate {
                generation,
                event,
            }),
        ) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Failed to watch candidates of {}: {}", session.call_id, e);
                return Err(self.abort(generation, e.into()).await);
            }
        };
        self.with_call(generation, |call| {
            call.subscriptions.push(subscription);
            call.session.claim_remote_description(offer.clone());
        })
        .ok_or(CallError::Cancelled)?;

        let answer = match peer.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.abort(generation, e.into()).await),
        };
        self.with_call(generation, |call| {
            call.session.local_description = Some(answer.clone());
        })
        .ok_or(CallError::Cancelled)?;

        self.drain_remote_candidates(generation).await;

        if let Err(e) = self
            .inner
            .channel
            .update(&session.channel_path, CallRecord::answer_update(&answer))
            .await
        {
            tracing::error!("Failed to write answer for call {}: {}", session.call_id, e);
            return Err(self.abort(generation, e.into()).await);
        }
        // Offer wurde während des Schreibens entfernt: Answer nicht stehen lassen
        if !self.is_current(generation) {
            self.remove_quietly(&session.channel_path).await;
            return Err(CallError::Cancelled);
        }
        tracing::debug!("Answer written to {}", session.channel_path);

        let connecting = self.with_call(generation, |call| {
            if call.session.phase == CallPhase::Negotiating(NegotiationRole::Answering) {
                call.session.phase = CallPhase::Connecting;
                true
            } else {
                false
            }
        });
        if connecting == Some(true) {
            self.emit(CallEvent::Connecting {
                call_id: session.call_id.clone(),
            });
        }

        self.flush_local_candidates(generation).await?;
        self.snapshot(generation).ok_or(CallError::Cancelled)
    }

    /// Lehnt den klingelnden Anruf ab, ohne Media anzufordern
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let generation = {
            let state = self.inner.state.lock();
            match state.active.as_ref() {
                Some(call) if call.session.is_ringing() => call.session.generation(),
                _ => return Err(CallError::NoActiveSession),
            }
        };

        self.end_session(generation, EndReason::Rejected).await;
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (generation, reason) = {
            let state = self.inner.state.lock();
            match state.active.as_ref() {
                Some(call) if !call.session.is_ended() => {
                    let reason = if call.session.is_ringing() {
                        EndReason::Rejected
                    } else {
                        EndReason::LocalHangup
                    };
                    (call.session.generation(), reason)
                }
                _ => return Err(CallError::NoActiveSession),
            }
        };

        self.end_session(generation, reason).await;
        Ok(())
    }

    // ========================================================================
    // MEDIA CONTROLS
    // ========================================================================

    /// Setzt Mute-Status
    pub fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let state = self.inner.state.lock();
        let media = state
            .active
            .as_ref()
            .and_then(|call| call.media.as_ref())
            .ok_or(CallError::NoActiveSession)?;
        media.set_muted(muted);
        Ok(())
    }

    /// Gibt Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .and_then(|call| call.media.as_ref())
            .map(|media| media.is_muted())
            .unwrap_or(false)
    }

    /// Gibt Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .and_then(|call| call.media.as_ref())
            .map(|media| media.levels())
            .unwrap_or((0.0, 0.0))
    }

    // ========================================================================
    // INBOX
    // ========================================================================

    async fn handle_input(&self, input: EngineInput) {
        match input {
            EngineInput::Inbox(event) => self.handle_inbox(event).await,
            EngineInput::CallRecord { generation, event } => {
                self.handle_call_record(generation, event).await
            }
            EngineInput::RemoteCandidate { generation, event } => {
                self.handle_remote_candidate(generation, event).await
            }
            EngineInput::Peer { generation, event } => {
                self.handle_peer_event(generation, event).await
            }
            EngineInput::DisconnectGraceElapsed { generation } => {
                let expired = self
                    .with_call(generation, |call| call.grace_timer.take().is_some())
                    .unwrap_or(false);
                if expired {
                    tracing::warn!("Peer did not recover within {:?}", self.inner.config.disconnect_grace);
                    self.abort(generation, CallError::PeerUnreachable).await;
                }
            }
            EngineInput::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_inbox(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::ChildAdded { key, value } => self.handle_offer(key, value).await,
            ChannelEvent::ChildRemoved { key, .. } => {
                let generation = {
                    let state = self.inner.state.lock();
                    match state.active.as_ref() {
                        Some(call)
                            if call.session.direction == Direction::Incoming
                                && call.session.call_id == key
                                && !call.session.is_ended() =>
                        {
                            call.session.generation()
                        }
                        _ => return,
                    }
                };

                tracing::info!("Call {} was ended by the caller", key);
                self.end_session(generation, EndReason::RemoteHangup).await;
            }
            ChannelEvent::Value(_) => {}
        }
    }

    async fn handle_offer(&self, call_id: String, value: serde_json::Value) {
        // Beantwortete Records und reine Candidate-Knoten sind keine Anrufe
        let Some(record) = CallRecord::from_value(&value).filter(CallRecord::is_offer) else {
            tracing::debug!("Ignoring non-offer record {}", call_id);
            return;
        };
        let config = &self.inner.config;
        if record.caller_id.is_empty() || record.caller_id == config.local_party_id {
            tracing::warn!("Ignoring offer {} with invalid caller", call_id);
            return;
        }
        let Some(offer) = record.description() else {
            tracing::warn!("Ignoring offer {} with malformed sdp", call_id);
            return;
        };

        enum Decision {
            Ring(CallSession),
            Busy,
            Duplicate,
        }

        let decision = {
            let mut state = self.inner.state.lock();
            let same_call = state
                .active
                .as_ref()
                .map(|call| call.session.call_id == call_id);
            match same_call {
                Some(true) => Decision::Duplicate,
                Some(false) => Decision::Busy,
                None => {
                    state.next_generation += 1;
                    let session = CallSession::incoming(
                        state.next_generation,
                        call_id.clone(),
                        &config.local_party_id,
                        &record.caller_id,
                        &record.caller_name,
                        CallKind::from_video(record.is_video),
                    );
                    state.active = Some(ActiveCall::new(session.clone(), Some(offer)));
                    Decision::Ring(session)
                }
            }
        };

        match decision {
            Decision::Ring(session) => {
                tracing::info!(
                    "Incoming call {} from {}",
                    session.call_id,
                    session.remote_party_id
                );
                self.emit(CallEvent::IncomingCall {
                    call_id: session.call_id,
                    caller_id: record.caller_id,
                    caller_name: record.caller_name,
                    kind: session.kind,
                });
            }
            Decision::Busy if config.decline_when_busy => {
                tracing::info!("Busy, declining call {} from {}", call_id, record.caller_id);
                self.remove_quietly(&call_record_path(&config.local_party_id, &call_id))
                    .await;
            }
            Decision::Busy => {
                tracing::debug!("Busy, ignoring call {}", call_id);
            }
            Decision::Duplicate => {}
        }
    }

    /// Value-Notification des eigenen Records (Caller)
    async fn handle_call_record(&self, generation: u64, event: ChannelEvent) {
        let ChannelEvent::Value(value) = event else {
            return;
        };

        let Some(value) = value else {
            // Record entfernt: vor dem Answer abgelehnt, danach aufgelegt
            let reason = self
                .with_call(generation, |call| {
                    if !call.record_seen {
                        return None;
                    }
                    Some(match call.session.phase {
                        CallPhase::Negotiating(NegotiationRole::Offering) => EndReason::Declined,
                        _ => EndReason::RemoteHangup,
                    })
                })
                .flatten();

            if let Some(reason) = reason {
                tracing::info!("Call record removed by peer ({:?})", reason);
                self.end_session(generation, reason).await;
            }
            return;
        };

        let Some(record) = CallRecord::from_value(&value) else {
            return;
        };

        let claimed = self
            .with_call(generation, |call| {
                call.record_seen = true;
                if !record.is_answer() {
                    return Ok(None);
                }
                let Some(answer) = record.description() else {
                    return Err(CallError::NegotiationRejected("malformed answer".to_string()));
                };
                if !call.session.claim_remote_description(answer.clone()) {
                    tracing::debug!("Ignoring duplicate answer for {}", call.session.call_id);
                    return Ok(None);
                }
                call.session.phase = CallPhase::Connecting;
                Ok(call
                    .peer
                    .clone()
                    .map(|peer| (peer, answer, call.session.call_id.clone())))
            })
            .unwrap_or(Ok(None));

        let (peer, answer, call_id) = match claimed {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!("Rejecting answer: {}", error);
                self.abort(generation, error).await;
                return;
            }
        };

        tracing::info!("Answer received for call {}", call_id);
        self.emit(CallEvent::Connecting { call_id });

        if let Err(e) = peer.set_remote_description(&answer).await {
            self.abort(generation, e.into()).await;
            return;
        }
        self.drain_remote_candidates(generation).await;
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.handle_local_candidate(generation, candidate).await
            }
            PeerEvent::StateChanged(state) => self.handle_peer_state(generation, state).await,
            PeerEvent::RemoteTrack(track) => {
                if let Some(call_id) = self.with_call(generation, |call| call.session.call_id.clone())
                {
                    tracing::info!("Remote {:?} track attached to call {}", track.kind, call_id);
                    self.emit(CallEvent::RemoteMedia { call_id, track });
                }
            }
        }
    }

    async fn handle_peer_state(&self, generation: u64, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                let connected = self
                    .with_call(generation, |call| {
                        if let Some(timer) = call.grace_timer.take() {
                            timer.abort();
                            tracing::info!("Peer reconnected");
                        }
                        match call.session.phase {
                            CallPhase::Negotiating(_) | CallPhase::Connecting => {
                                call.session.phase = CallPhase::Active;
                                Some(call.session.call_id.clone())
                            }
                            _ => None,
                        }
                    })
                    .flatten();

                if let Some(call_id) = connected {
                    tracing::info!("Call {} connected", call_id);
                    self.emit(CallEvent::Connected { call_id });
                }
            }
            PeerConnectionState::Disconnected => {
                let grace = self.inner.config.disconnect_grace;
                let tx = self.inner.input_tx.clone();
                self.with_call(generation, |call| {
                    if call.grace_timer.is_some() {
                        return;
                    }
                    tracing::warn!("Peer disconnected, waiting {:?} for recovery", grace);
                    call.grace_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = tx.send(EngineInput::DisconnectGraceElapsed { generation });
                    }));
                });
            }
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                if self.is_current(generation) {
                    tracing::warn!("Peer connection {:?}", state);
                    self.abort(generation, CallError::PeerUnreachable).await;
                }
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }

    // ========================================================================
    // PRIVATE HELPERS
    // ========================================================================

    /// Führt `f` auf der Session aus, falls `generation` noch aktiv ist
    fn with_call<R>(&self, generation: u64, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut state = self.inner.state.lock();
        match state.active.as_mut() {
            Some(call)
                if call.session.generation() == generation && !call.session.is_ended() =>
            {
                Some(f(call))
            }
            _ => None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.with_call(generation, |_| ()).is_some()
    }

    fn snapshot(&self, generation: u64) -> Option<CallSession> {
        self.with_call(generation, |call| call.session.clone())
    }

    fn channel_sink(
        &self,
        generation: u64,
        wrap: fn(u64, ChannelEvent) -> EngineInput,
    ) -> ChannelSink {
        let tx = self.inner.input_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(wrap(generation, event));
        })
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallSignalingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSignalingEngine")
            .field("local_party_id", &self.inner.config.local_party_id)
            .field("phase", &self.session().map(|session| session.phase))
            .finish()
    }
}

/// Verarbeitet die Inbox nacheinander, bis die Engine gedroppt wird
async fn run_inbox(inner: Weak<EngineInner>, mut input_rx: mpsc::UnboundedReceiver<EngineInput>) {
    while let Some(input) = input_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        CallSignalingEngine { inner }.handle_input(input).await;
    }
    tracing::debug!("Call engine inbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        assert_eq!(
            CallError::from(ChannelError::Timeout),
            CallError::ChannelWriteFailed("Write timed out".to_string())
        );
        assert!(matches!(
            CallError::from(MediaError::NoInputDevice),
            CallError::MediaUnavailable(_)
        ));
        assert!(matches!(
            CallError::from(PeerError::InvalidDescription("bad".into())),
            CallError::NegotiationRejected(_)
        ));
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::new("alice", "Alice");
        assert!(config.decline_when_busy);
        assert_eq!(config.disconnect_grace, Duration::from_secs(5));
    }
}
