//! Message Types für das Relay-Protokoll
//!
//! Der Relay-Server hält den Keyed Store; der Client schickt signierte
//! Mutationen und Subscriptions, der Server antwortet mit Acks und
//! Notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Subscription-Modus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Children,
    Value,
}

/// Alle Client-Nachrichten (werden vor dem Senden signiert)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung am Relay
    Hello {
        #[serde(rename = "partyId")]
        party_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Knoten ersetzen
    Set {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        value: Value,
    },

    /// Felder mergen
    Update {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        value: Value,
    },

    /// Knoten löschen
    Remove {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
    },

    /// Notifications für einen Pfad anfordern
    Subscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        path: String,
        mode: SubscriptionMode,
    },

    /// Notifications abbestellen
    Unsubscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
    },

    /// Heartbeat
    Heartbeat {
        #[serde(rename = "partyId")]
        party_id: String,
    },
}

impl ClientMessage {
    /// Request-ID einer Mutation (falls vorhanden)
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Set { request_id, .. }
            | Self::Update { request_id, .. }
            | Self::Remove { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Anmeldung bestätigt
    Welcome {
        #[serde(rename = "partyId")]
        party_id: String,
        timestamp: i64,
    },

    /// Mutation übernommen
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
        timestamp: i64,
    },

    /// Child hinzugekommen
    ChildAdded {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        key: String,
        value: Value,
        timestamp: i64,
    },

    /// Child entfernt
    ChildRemoved {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        key: String,
        #[serde(default)]
        value: Value,
        timestamp: i64,
    },

    /// Aktueller Wert eines Knotens
    Value {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        #[serde(default)]
        value: Option<Value>,
        timestamp: i64,
    },

    /// Fehler (optional einer Mutation zugeordnet)
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_format() {
        let msg = ClientMessage::Set {
            request_id: 7,
            path: "calls/bob/c1".to_string(),
            value: json!({"type": "offer"}),
        };
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "set");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["path"], "calls/bob/c1");
        assert_eq!(msg.request_id(), Some(7));

        let sub = ClientMessage::Subscribe {
            subscription_id: 3,
            path: "calls/bob".to_string(),
            mode: SubscriptionMode::Children,
        };
        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["mode"], "children");
        assert_eq!(sub.request_id(), None);
    }

    #[test]
    fn test_server_message_parsing() {
        let raw = r#"{"type":"child_added","subscriptionId":2,"key":"c1","value":{"type":"offer"},"timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::ChildAdded { subscription_id: 2, ref key, .. } if key == "c1"
        ));

        // Gelöschter Knoten kommt als value ohne Inhalt
        let raw = r#"{"type":"value","subscriptionId":4,"timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ServerMessage::Value { value: None, .. }));

        let raw = r#"{"type":"error","code":403,"message":"forbidden","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ServerMessage::Error { request_id: None, code: 403, .. }));
    }
}
