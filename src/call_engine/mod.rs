//! Call Engine Module
//!
//! Dieses Modul enthält die Signaling-Zustandsmaschine und ihre Capabilities:
//! - `CallSignalingEngine`: Offer/Answer, Candidate-Relay, Teardown
//! - `CallSession` und die Records im Kanal
//! - `PeerSession` (WebRTC) und `MediaSource` (cpal)
//!

mod audio;
mod engine;
mod media;
mod peer;
mod record;
mod session;

pub use engine::{CallError, CallEvent, CallSignalingEngine, EngineConfig};
pub use media::{CpalMediaSource, LocalMedia, LocalTrack, MediaError, MediaSource, TrackKind};
pub use peer::{
    PeerConnectionState, PeerError, PeerEvent, PeerEventSink, PeerSession, PeerSessionFactory,
    RemoteTrack, WebRtcPeerFactory, WebRtcPeerSession,
};
pub use record::{
    call_record_path, candidates_path, inbox_path, CallRecord, IceCandidate, RecordType, SdpType,
    SessionDescription,
};
pub use session::{CallKind, CallPhase, CallSession, Direction, EndReason, NegotiationRole};
