//! Signaling-Records im Keyed Store
//!
//! Ein Anrufversuch lebt unter `calls/{recipientId}/{callId}`:
//!
//! ```text
//! { callerId, callerName, type: "offer" | "answer", isVideo, sdp,
//!   candidates: { <push-id>: "<candidate json>", ... } }
//! ```
//!
//! Der Callee legt seine Candidates unter `calls/{callerId}/{callId}/candidates`
//! ab, weil der Caller dort lauscht.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wurzel aller Call-Records
pub const CALLS_ROOT: &str = "calls";

/// Child-Key der Candidate-Sequenz
pub const CANDIDATES_KEY: &str = "candidates";

/// Eingang einer Party: `calls/{party}`
pub fn inbox_path(party_id: &str) -> String {
    format!("{CALLS_ROOT}/{party_id}")
}

/// Record eines Anrufs: `calls/{recipient}/{callId}`
pub fn call_record_path(recipient_id: &str, call_id: &str) -> String {
    format!("{CALLS_ROOT}/{recipient_id}/{call_id}")
}

/// Candidate-Sequenz unter einem Record
pub fn candidates_path(owner_id: &str, call_id: &str) -> String {
    format!("{CALLS_ROOT}/{owner_id}/{call_id}/{CANDIDATES_KEY}")
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Serialisierte Beschreibung der Media-/Transport-Parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Form im `sdp`-Feld des Records: `{"type":..,"sdp":..}` als JSON-Text
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Liest das `sdp`-Feld; rohes SDP wird mit dem erwarteten Typ akzeptiert
    pub fn from_wire(raw: &str, expected: SdpType) -> Option<Self> {
        match serde_json::from_str::<SessionDescription>(raw) {
            Ok(description) if description.sdp_type == expected => Some(description),
            Ok(_) => None,
            Err(_) if raw.trim_start().starts_with("v=") => Some(Self {
                sdp_type: expected,
                sdp: raw.to_string(),
            }),
            Err(_) => None,
        }
    }
}

// ============================================================================
// ICE CANDIDATE
// ============================================================================

/// Ein möglicher Netzwerkpfad zum Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Candidate-Records sind JSON-Text
    pub fn to_value(&self) -> Value {
        Value::String(serde_json::to_string(self).unwrap_or_default())
    }

    /// Akzeptiert JSON-Text oder ein Objekt
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Typ des Call-Records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Offer,
    Answer,
}

/// Top-Level Record unter `calls/{recipient}/{callId}`
///
/// Candidate-Children werden beim Lesen ignoriert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(default)]
    pub caller_id: String,
    #[serde(default)]
    pub caller_name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<RecordType>,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

impl CallRecord {
    /// Offer-Record des Callers
    pub fn offer(
        caller_id: &str,
        caller_name: &str,
        is_video: bool,
        description: &SessionDescription,
    ) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            caller_name: caller_name.to_string(),
            record_type: Some(RecordType::Offer),
            is_video,
            sdp: Some(description.to_wire()),
        }
    }

    /// Partial-Update des Callees (`type` + `sdp`)
    pub fn answer_update(description: &SessionDescription) -> Value {
        serde_json::json!({
            "type": RecordType::Answer,
            "sdp": description.to_wire(),
        })
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Description passend zum Record-Typ
    pub fn description(&self) -> Option<SessionDescription> {
        let expected = match self.record_type? {
            RecordType::Offer => SdpType::Offer,
            RecordType::Answer => SdpType::Answer,
        };
        SessionDescription::from_wire(self.sdp.as_deref()?, expected)
    }

    pub fn is_offer(&self) -> bool {
        self.record_type == Some(RecordType::Offer)
    }

    pub fn is_answer(&self) -> bool {
        self.record_type == Some(RecordType::Answer)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths() {
        assert_eq!(inbox_path("bob"), "calls/bob");
        assert_eq!(call_record_path("bob", "c1"), "calls/bob/c1");
        assert_eq!(candidates_path("alice", "c1"), "calls/alice/c1/candidates");
    }

    #[test]
    fn test_offer_record_format() {
        let offer = SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n");
        let value = CallRecord::offer("alice", "Alice", true, &offer).to_value();

        assert_eq!(value["callerId"], "alice");
        assert_eq!(value["callerName"], "Alice");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["isVideo"], true);

        // sdp ist JSON-Text mit type + sdp
        let inner: Value = serde_json::from_str(value["sdp"].as_str().unwrap()).unwrap();
        assert_eq!(inner["type"], "offer");
        assert_eq!(inner["sdp"], offer.sdp);
    }

    #[test]
    fn test_answered_record_with_candidates() {
        let answer = SessionDescription::answer("v=0 answer");
        let value = json!({
            "callerId": "alice",
            "callerName": "Alice",
            "type": "answer",
            "isVideo": false,
            "sdp": answer.to_wire(),
            "candidates": { "-abc": "{\"candidate\":\"c\"}" }
        });

        let record = CallRecord::from_value(&value).unwrap();
        assert!(record.is_answer());
        assert_eq!(record.description(), Some(answer));
    }

    #[test]
    fn test_candidate_only_node_has_no_type() {
        // Knoten, den nur Candidates des Callees erzeugt haben
        let value = json!({ "candidates": { "-abc": "{\"candidate\":\"c\"}" } });
        let record = CallRecord::from_value(&value).unwrap();
        assert_eq!(record.record_type, None);
        assert_eq!(record.description(), None);
    }

    #[test]
    fn test_description_accepts_raw_sdp() {
        let parsed = SessionDescription::from_wire("v=0\r\ns=-\r\n", SdpType::Offer).unwrap();
        assert_eq!(parsed.sdp_type, SdpType::Offer);

        // Falscher Typ wird verworfen
        let answer = SessionDescription::answer("v=0").to_wire();
        assert_eq!(SessionDescription::from_wire(&answer, SdpType::Offer), None);
        assert_eq!(SessionDescription::from_wire("garbage", SdpType::Offer), None);
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let value = candidate.to_value();
        let raw: Value = serde_json::from_str(value.as_str().unwrap()).unwrap();
        assert_eq!(raw["sdpMid"], "0");
        assert_eq!(raw["sdpMLineIndex"], 0);
        assert!(raw.get("usernameFragment").is_none());

        assert_eq!(IceCandidate::from_value(&value), Some(candidate.clone()));
        assert_eq!(IceCandidate::from_value(&raw), Some(candidate));
        assert_eq!(IceCandidate::from_value(&json!(42)), None);
    }
}
