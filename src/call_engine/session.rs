//! Call Session - Datenmodell eines Anrufversuchs
//!
//! Eine `CallSession` wird ausschließlich von der Engine mutiert, als
//! Reaktion auf lokale Aktionen oder Kanal-Notifications.

use super::engine::CallError;
use super::record::{call_record_path, candidates_path, IceCandidate, SessionDescription};
use std::collections::VecDeque;

// ============================================================================
// ENUMS
// ============================================================================

/// Richtung aus Sicht der lokalen Party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    AudioOnly,
    AudioVideo,
}

impl CallKind {
    pub fn from_video(is_video: bool) -> Self {
        if is_video {
            Self::AudioVideo
        } else {
            Self::AudioOnly
        }
    }

    pub fn is_video(self) -> bool {
        self == Self::AudioVideo
    }
}

/// Rolle während der Offer/Answer-Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offering,
    Answering,
}

/// Grund für das Ende eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Peer hat den Record entfernt
    RemoteHangup,
    /// Eingehenden Anruf abgelehnt
    Rejected,
    /// Unser Offer wurde vor einer Antwort entfernt
    Declined,
    /// Terminaler Fehler
    Failed(CallError),
}

/// Phase eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    /// Eingehend, wartet auf Entscheidung
    Idle,
    Negotiating(NegotiationRole),
    Connecting,
    Active,
    Ended(EndReason),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein laufender oder beendeter Anrufversuch
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_id: String,
    pub direction: Direction,
    pub local_party_id: String,
    pub remote_party_id: String,
    /// Anzeigename des Callers (nur eingehend bekannt)
    pub remote_party_name: Option<String>,
    pub kind: CallKind,
    pub phase: CallPhase,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub pending_local_candidates: VecDeque<IceCandidate>,
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    /// Pfad des geteilten Records (`calls/{callee}/{callId}`)
    pub channel_path: String,
    generation: u64,
}

impl CallSession {
    pub(crate) fn outgoing(
        generation: u64,
        call_id: String,
        local_party_id: &str,
        remote_party_id: &str,
        kind: CallKind,
    ) -> Self {
        Self {
            channel_path: call_record_path(remote_party_id, &call_id),
            call_id,
            direction: Direction::Outgoing,
            local_party_id: local_party_id.to_string(),
            remote_party_id: remote_party_id.to_string(),
            remote_party_name: None,
            kind,
            phase: CallPhase::Negotiating(NegotiationRole::Offering),
            local_description: None,
            remote_description: None,
            pending_local_candidates: VecDeque::new(),
            pending_remote_candidates: VecDeque::new(),
            generation,
        }
    }

    pub(crate) fn incoming(
        generation: u64,
        call_id: String,
        local_party_id: &str,
        caller_id: &str,
        caller_name: &str,
        kind: CallKind,
    ) -> Self {
        Self {
            channel_path: call_record_path(local_party_id, &call_id),
            call_id,
            direction: Direction::Incoming,
            local_party_id: local_party_id.to_string(),
            remote_party_id: caller_id.to_string(),
            remote_party_name: Some(caller_name.to_string()).filter(|n| !n.is_empty()),
            kind,
            phase: CallPhase::Idle,
            local_description: None,
            remote_description: None,
            pending_local_candidates: VecDeque::new(),
            pending_remote_candidates: VecDeque::new(),
            generation,
        }
    }

    /// Generation der Session; Callbacks älterer Sessions werden verworfen
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.phase, CallPhase::Ended(_))
    }

    /// Eingehend und noch nicht angenommen
    pub fn is_ringing(&self) -> bool {
        self.direction == Direction::Incoming && self.phase == CallPhase::Idle
    }

    /// Setzt die Remote Description genau einmal.
    ///
    /// Gibt `false` zurück, wenn bereits eine gesetzt war.
    pub fn claim_remote_description(&mut self, description: SessionDescription) -> bool {
        if self.remote_description.is_some() {
            return false;
        }
        self.remote_description = Some(description);
        true
    }

    /// Hier schreibt die lokale Seite ihre Candidates hin
    pub fn outbound_candidates_path(&self) -> String {
        candidates_path(&self.remote_party_id, &self.call_id)
    }

    /// Hier lauscht die lokale Seite auf Candidates des Peers
    pub fn inbound_candidates_path(&self) -> String {
        candidates_path(&self.local_party_id, &self.call_id)
    }

    /// Record, unter dem der Peer seine Candidates ablegt
    /// (Caller: eigener Eingang, Callee: Eingang des Callers)
    pub fn candidate_record_path(&self) -> String {
        match self.direction {
            Direction::Outgoing => call_record_path(&self.local_party_id, &self.call_id),
            Direction::Incoming => call_record_path(&self.remote_party_id, &self.call_id),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_paths() {
        let session =
            CallSession::outgoing(1, "c1".to_string(), "alice", "bob", CallKind::AudioVideo);

        assert_eq!(session.channel_path, "calls/bob/c1");
        // Caller schreibt in den Record des Callees ...
        assert_eq!(session.outbound_candidates_path(), "calls/bob/c1/candidates");
        // ... und lauscht im eigenen Eingang
        assert_eq!(session.inbound_candidates_path(), "calls/alice/c1/candidates");
        assert_eq!(session.candidate_record_path(), "calls/alice/c1");
        assert_eq!(
            session.phase,
            CallPhase::Negotiating(NegotiationRole::Offering)
        );
    }

    #[test]
    fn test_incoming_paths() {
        let session = CallSession::incoming(
            2,
            "c1".to_string(),
            "bob",
            "alice",
            "Alice",
            CallKind::AudioOnly,
        );

        assert_eq!(session.channel_path, "calls/bob/c1");
        // Callee schreibt in den Eingang des Callers
        assert_eq!(session.outbound_candidates_path(), "calls/alice/c1/candidates");
        assert_eq!(session.inbound_candidates_path(), "calls/bob/c1/candidates");
        assert_eq!(session.candidate_record_path(), "calls/alice/c1");
        assert!(session.is_ringing());
        assert_eq!(session.remote_party_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_remote_description_is_claimed_once() {
        let mut session =
            CallSession::outgoing(1, "c1".to_string(), "alice", "bob", CallKind::AudioOnly);

        assert!(session.claim_remote_description(SessionDescription::answer("first")));
        assert!(!session.claim_remote_description(SessionDescription::answer("second")));
        assert_eq!(
            session.remote_description,
            Some(SessionDescription::answer("first"))
        );
    }

    #[test]
    fn test_call_kind() {
        assert_eq!(CallKind::from_video(true), CallKind::AudioVideo);
        assert!(!CallKind::from_video(false).is_video());
    }
}
