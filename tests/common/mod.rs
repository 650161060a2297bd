//! Shared test infrastructure for call engine integration tests
//!
//! Provides:
//! - FakePeerFactory / FakePeerSession: scripted negotiation capability
//! - FakeMediaSource: counts acquisitions, can fail or block
//! - FlakyChannel: MemoryChannel with switchable write failures
//! - Party: one engine with its fakes and an event receiver

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::call_engine::{
    CallEvent, CallKind, CallSignalingEngine, EngineConfig, IceCandidate, LocalMedia, LocalTrack,
    MediaError, MediaSource, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    PeerSession, PeerSessionFactory, SessionDescription,
};
use pulse_call::signaling::{
    ChannelError, ChannelSink, MemoryChannel, RealtimeChannel, Subscription,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

// ============================================================================
// FAKE PEER SESSION
// ============================================================================

pub struct FakePeerSession {
    pub label: String,
    sink: PeerEventSink,
    has_remote: AtomicBool,
    /// Aufrufe von set_remote_description/create_answer
    pub remote_description_calls: AtomicUsize,
    pub applied_candidates: Mutex<Vec<String>>,
    /// add_ice_candidate ohne Remote Description
    pub premature_candidates: AtomicUsize,
    pub tracks: Mutex<Vec<LocalTrack>>,
    pub closed: AtomicBool,
    /// Werden beim Erstellen von Offer/Answer sofort gemeldet
    early_candidates: Vec<String>,
    /// create_answer schlägt fehl
    pub fail_answer: AtomicBool,
    /// set_remote_description verwirft jede Description
    pub reject_remote: AtomicBool,
}

impl FakePeerSession {
    pub fn emit(&self, event: PeerEvent) {
        (self.sink)(event);
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied_candidates.lock().clone()
    }

    pub fn remote_calls(&self) -> usize {
        self.remote_description_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for FakePeerSession {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        for candidate in &self.early_candidates {
            self.emit_candidate(candidate);
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns=offer-{}\r\n",
            self.label
        )))
    }

    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidDescription("incompatible offer".into()));
        }
        self.set_remote_description(remote).await?;
        for candidate in &self.early_candidates {
            self.emit_candidate(candidate);
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\ns=answer-{}\r\n",
            self.label
        )))
    }

    async fn set_remote_description(
        &self,
        _description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.remote_description_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidDescription("no common codec".into()));
        }
        if self.has_remote.swap(true, Ordering::SeqCst) {
            return Err(PeerError::WebRtc("remote description already set".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            self.premature_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(PeerError::RemoteDescriptionMissing);
        }
        self.applied_candidates
            .lock()
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub sessions: Mutex<Vec<Arc<FakePeerSession>>>,
    pub early_candidates: Mutex<Vec<String>>,
    /// Gilt für alle danach erstellten Sessions
    pub fail_answer: AtomicBool,
    pub reject_remote: AtomicBool,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last(&self) -> Arc<FakePeerSession> {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no peer session created")
    }
}

#[async_trait]
impl PeerSessionFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerSession>, PeerError> {
        let mut sessions = self.sessions.lock();
        let session = Arc::new(FakePeerSession {
            label: format!("pc{}", sessions.len() + 1),
            sink: events,
            has_remote: AtomicBool::new(false),
            remote_description_calls: AtomicUsize::new(0),
            applied_candidates: Mutex::new(Vec::new()),
            premature_candidates: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            early_candidates: self.early_candidates.lock().clone(),
            fail_answer: AtomicBool::new(self.fail_answer.load(Ordering::SeqCst)),
            reject_remote: AtomicBool::new(self.reject_remote.load(Ordering::SeqCst)),
        });
        sessions.push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// FAKE MEDIA SOURCE
// ============================================================================

#[derive(Default)]
pub struct FakeMediaState {
    pub stopped: AtomicBool,
    pub muted: AtomicBool,
}

struct FakeMedia {
    kind: CallKind,
    state: Arc<FakeMediaState>,
}

impl LocalMedia for FakeMedia {
    fn tracks(&self) -> Vec<LocalTrack> {
        match self.kind {
            CallKind::AudioOnly => vec![LocalTrack::audio()],
            CallKind::AudioVideo => vec![LocalTrack::audio(), LocalTrack::video()],
        }
    }

    fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }

    fn set_muted(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeMediaSource {
    pub acquisitions: AtomicUsize,
    pub fail: AtomicBool,
    /// Falls gesetzt, blockiert acquire bis notify_one()
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub media: Mutex<Vec<Arc<FakeMediaState>>>,
}

impl FakeMediaSource {
    pub fn acquired(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn all_stopped(&self) -> bool {
        self.media
            .lock()
            .iter()
            .all(|m| m.stopped.load(Ordering::SeqCst))
    }

    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, kind: CallKind) -> Result<Box<dyn LocalMedia>, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::NoInputDevice);
        }

        let state = Arc::new(FakeMediaState::default());
        self.media.lock().push(Arc::clone(&state));
        Ok(Box::new(FakeMedia { kind, state }))
    }
}

// ============================================================================
// FLAKY CHANNEL
// ============================================================================

/// MemoryChannel, dessen Writes sich gezielt fehlschlagen lassen
#[derive(Default)]
pub struct FlakyChannel {
    pub inner: MemoryChannel,
    pub fail_writes: AtomicBool,
    pub fail_updates: AtomicBool,
    /// subscribe/subscribe_value schlagen fehl (Sende-Queue voll)
    pub fail_subscribe: AtomicBool,
    /// Pfade aller erfolgreichen write/update-Aufrufe
    pub log: Mutex<Vec<String>>,
}

#[async_trait]
impl RealtimeChannel for FlakyChannel {
    async fn write(&self, path: &str, value: Value) -> Result<(), ChannelError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChannelError::WriteFailed("permission denied".into()));
        }
        self.inner.write(path, value).await?;
        self.log.lock().push(path.to_string());
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), ChannelError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout);
        }
        self.inner.update(path, partial).await?;
        self.log.lock().push(path.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), ChannelError> {
        self.inner.remove(path).await
    }

    fn subscribe(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::WriteFailed("queue full".into()));
        }
        self.inner.subscribe(path, sink)
    }

    fn subscribe_value(&self, path: &str, sink: ChannelSink) -> Result<Subscription, ChannelError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::WriteFailed("queue full".into()));
        }
        self.inner.subscribe_value(path, sink)
    }
}

// ============================================================================
// PARTY
// ============================================================================

pub struct Party {
    pub engine: CallSignalingEngine,
    pub peers: Arc<FakePeerFactory>,
    pub media: Arc<FakeMediaSource>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Party {
    pub fn new(party_id: &str, channel: Arc<dyn RealtimeChannel>) -> Self {
        Self::with_config(EngineConfig::new(party_id, party_id.to_uppercase()), channel)
    }

    pub fn with_config(config: EngineConfig, channel: Arc<dyn RealtimeChannel>) -> Self {
        let peers = Arc::new(FakePeerFactory::default());
        let media = Arc::new(FakeMediaSource::default());
        let engine = CallSignalingEngine::new(
            config,
            channel,
            Arc::clone(&peers) as Arc<dyn PeerSessionFactory>,
            Arc::clone(&media) as Arc<dyn MediaSource>,
        );
        let events = engine.subscribe();
        engine.start().expect("engine start");

        Self {
            engine,
            peers,
            media,
            events,
        }
    }

    /// Wartet auf das erste Event, das `predicate` erfüllt
    pub async fn wait_for(&mut self, predicate: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for call event")
    }

    /// Verarbeitet alle ausstehenden Notifications
    pub async fn settle(&self) {
        self.engine.settle().await;
    }
}

/// Lässt beide Engines zur Ruhe kommen (Notifications können hin und her gehen)
pub async fn settle_all(parties: &[&Party]) {
    for _ in 0..3 {
        for party in parties {
            party.settle().await;
        }
    }
}

pub fn memory() -> (MemoryChannel, Arc<dyn RealtimeChannel>) {
    let channel = MemoryChannel::new();
    let shared: Arc<dyn RealtimeChannel> = Arc::new(channel.clone());
    (channel, shared)
}

pub fn is_ended(event: &CallEvent) -> bool {
    matches!(event, CallEvent::Ended { .. })
}
