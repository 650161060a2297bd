//! Peer Session - Offer/Answer und ICE über WebRTC
//!
//! Die Engine spricht nur mit dem `PeerSession`-Trait. `WebRtcPeerFactory`
//! ist die Implementierung auf Basis von `webrtc-rs`.

use super::audio::SAMPLE_RATE;
use super::media::{LocalTrack, TrackKind};
use super::record::{IceCandidate, SdpType, SessionDescription};
use crate::config::IceServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Remote description not set")]
    RemoteDescriptionMissing,

    #[error("Peer connection closed")]
    Closed,
}

fn webrtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRtc(e.to_string())
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungsstatus der PeerSession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Eingehender Track des Peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Lokal gefundener Candidate (Trickle)
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack(RemoteTrack),
}

/// Callback für PeerSession-Events; darf nicht blockieren
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Erstellt das Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Setzt `remote` als Remote Description und erstellt das Answer
    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError>;

    /// Schlägt fehl, solange keine Remote Description gesetzt ist
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Gibt alle Ressourcen frei; idempotent
    async fn close(&self);
}

#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerSession>, PeerError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Erzeugt `RTCPeerConnection`s mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[IceServer]) -> Self {
        Self {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[async_trait]
impl PeerSessionFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerSession>, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_error)?,
        );

        let closed = Arc::new(AtomicBool::new(false));
        register_handlers(&pc, events, Arc::clone(&closed));

        Ok(Arc::new(WebRtcPeerSession {
            pc,
            closed,
            local_tracks: Mutex::new(Vec::new()),
        }))
    }
}

/// Leitet die Callbacks der Peer Connection an den Event-Sink weiter
fn register_handlers(pc: &RTCPeerConnection, events: PeerEventSink, closed: Arc<AtomicBool>) {
    let sink = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", state);
        if !closed.load(Ordering::SeqCst) {
            sink(PeerEvent::StateChanged(state.into()));
        }
        Box::pin(async {})
    }));

    let sink = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None markiert das Ende des Gatherings
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => sink(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received track: {:?}", track.codec());
        sink(PeerEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

/// PeerSession über eine `RTCPeerConnection`
pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

impl WebRtcPeerSession {
    /// RTP-Tracks, in die ein Encoder Pakete schreiben kann
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.local_tracks.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.ensure_open()?;

        let capability = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtp_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id.clone(),
            "pulse-call".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;

        self.local_tracks.lock().push(rtp_track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;

        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.set_remote_description(remote).await?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_error)?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;

        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;

        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::RemoteDescriptionMissing);
        }

        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local_tracks.lock().clear();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for WebRtcPeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeerSession")
            .field("state", &self.pc.connection_state())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }

    #[test]
    fn test_ice_servers_from_config() {
        let factory = WebRtcPeerFactory::new(&[IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("user".to_string()),
            credential: None,
        }]);
        assert_eq!(factory.ice_servers[0].username, "user");
        assert_eq!(factory.ice_servers[0].credential, "");
    }
}
