//! WsChannel gegen einen lokalen Relay
//!
//! Der "Relay" ist ein einzelner WebSocket-Endpunkt, den jeder Test selbst
//! skriptet: Frames lesen, prüfen, beantworten.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use futures::{SinkExt, StreamExt};
use pulse_call::crypto::KeyPair;
use pulse_call::signaling::{
    ChannelError, ChannelEvent, ChannelSink, RealtimeChannel, WsChannel, WsChannelConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Relay = WebSocketStream<TcpStream>;

// ============================================================================
// HELPERS
// ============================================================================

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

fn config(url: &str) -> WsChannelConfig {
    WsChannelConfig {
        url: url.to_string(),
        party_id: "alice".to_string(),
        connect_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::ZERO,
    }
}

async fn accept(listener: &TcpListener) -> Relay {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Nächstes Text-Frame des Clients als JSON
async fn next_frame(relay: &mut Relay) -> Value {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            match relay.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("relay stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for client frame")
}

async fn reply(relay: &mut Relay, mut frame: Value) {
    frame["timestamp"] = json!(chrono::Utc::now().timestamp_millis());
    relay.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Verbindet `alice` und beantwortet den Handshake
async fn connect(listener: &TcpListener, url: &str) -> (Arc<WsChannel>, Relay, Value) {
    let keypair = Arc::new(KeyPair::generate());
    let (channel, (relay, hello)) = tokio::join!(WsChannel::connect(config(url), keypair), async {
        let mut relay = accept(listener).await;
        let hello = next_frame(&mut relay).await;
        reply(&mut relay, json!({"type": "welcome", "partyId": "alice"})).await;
        (relay, hello)
    });
    (channel.unwrap(), relay, hello)
}

fn recorder() -> (ChannelSink, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: ChannelSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_handshake_is_signed() {
    let (listener, url) = listen().await;
    let (channel, _relay, hello) = connect(&listener, &url).await;

    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["partyId"], "alice");
    assert!(hello["timestamp"].is_i64());

    let bytes = BASE64.decode(hello["publicKey"].as_str().unwrap()).unwrap();
    let key = VerifyingKey::from_bytes(&bytes.try_into().unwrap()).unwrap();
    assert!(KeyPair::verify_message(&key, &hello));

    // Manipuliertes Frame besteht die Prüfung nicht
    let mut forged = hello.clone();
    forged["partyId"] = json!("mallory");
    assert!(!KeyPair::verify_message(&key, &forged));

    assert!(channel.is_connected());
    assert_eq!(channel.party_id().as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_write_and_subscribe() {
    let (listener, url) = listen().await;
    let (channel, mut relay, _) = connect(&listener, &url).await;

    // set → ack
    let (written, frame) = tokio::join!(
        channel.write("calls/bob/c1", json!({"type": "offer"})),
        async {
            let frame = next_frame(&mut relay).await;
            reply(
                &mut relay,
                json!({"type": "ack", "requestId": frame["requestId"]}),
            )
            .await;
            frame
        }
    );
    written.unwrap();
    assert_eq!(frame["type"], "set");
    assert_eq!(frame["path"], "calls/bob/c1");
    assert_eq!(frame["value"]["type"], "offer");
    assert!(frame["signature"].is_string());

    // subscribe → child_added
    let (sink, mut events) = recorder();
    let subscription = channel.subscribe("calls/alice", sink).unwrap();
    let frame = next_frame(&mut relay).await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["mode"], "children");
    let subscription_id = frame["subscriptionId"].clone();

    reply(
        &mut relay,
        json!({
            "type": "child_added",
            "subscriptionId": subscription_id,
            "key": "c9",
            "value": {"type": "offer", "callerId": "bob"},
        }),
    )
    .await;
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ChannelEvent::ChildAdded {
            key: "c9".to_string(),
            value: json!({"type": "offer", "callerId": "bob"}),
        }
    );

    // Drop meldet die Subscription ab
    drop(subscription);
    let frame = next_frame(&mut relay).await;
    assert_eq!(frame["type"], "unsubscribe");
    assert_eq!(frame["subscriptionId"], subscription_id);
}

#[tokio::test]
async fn test_rejected_update() {
    let (listener, url) = listen().await;
    let (channel, mut relay, _) = connect(&listener, &url).await;

    let (result, _) = tokio::join!(
        channel.update("calls/bob/c1", json!({"type": "answer"})),
        async {
            let frame = next_frame(&mut relay).await;
            assert_eq!(frame["type"], "update");
            reply(
                &mut relay,
                json!({
                    "type": "error",
                    "requestId": frame["requestId"],
                    "code": 403,
                    "message": "forbidden",
                }),
            )
            .await;
        }
    );

    assert_eq!(
        result.unwrap_err(),
        ChannelError::Rejected {
            code: 403,
            message: "forbidden".to_string(),
        }
    );
    // Verbindung bleibt bestehen
    assert!(channel.is_connected());
}

#[tokio::test]
async fn test_write_times_out_without_ack() {
    let (listener, url) = listen().await;
    let keypair = Arc::new(KeyPair::generate());
    let config = WsChannelConfig {
        write_timeout: Duration::from_millis(100),
        ..config(&url)
    };
    let (channel, mut relay) = tokio::join!(WsChannel::connect(config, keypair), async {
        let mut relay = accept(&listener).await;
        next_frame(&mut relay).await;
        reply(&mut relay, json!({"type": "welcome", "partyId": "alice"})).await;
        relay
    });
    let channel = channel.unwrap();

    let (result, frame) = tokio::join!(channel.remove("calls/bob/c1"), next_frame(&mut relay));
    assert_eq!(frame["type"], "remove");
    assert_eq!(result.unwrap_err(), ChannelError::Timeout);
}

#[tokio::test]
async fn test_relay_close_fails_pending_writes() {
    let (listener, url) = listen().await;
    let (channel, mut relay, _) = connect(&listener, &url).await;
    let mut status = channel.subscribe_events();

    let (result, _) = tokio::join!(
        channel.write("calls/bob/c1", json!({"type": "offer"})),
        async {
            next_frame(&mut relay).await;
            relay.close(None).await.unwrap();
        }
    );

    assert_eq!(result.unwrap_err(), ChannelError::NotConnected);
    assert!(!channel.is_connected());
    assert!(matches!(
        status.recv().await,
        Ok(pulse_call::signaling::ConnectionEvent::Disconnected)
    ));

    // Nach dem Verbindungsabbruch wird nichts mehr gesendet
    assert_eq!(
        channel.write("calls/bob/c2", json!(1)).await.unwrap_err(),
        ChannelError::NotConnected
    );
    let (sink, _events) = recorder();
    assert!(matches!(
        channel.subscribe_value("calls/bob/c2", sink),
        Err(ChannelError::NotConnected)
    ));
}

#[tokio::test]
async fn test_handshake_rejected() {
    let (listener, url) = listen().await;
    let keypair = Arc::new(KeyPair::generate());

    let (result, _) = tokio::join!(WsChannel::connect(config(&url), keypair), async {
        let mut relay = accept(&listener).await;
        next_frame(&mut relay).await;
        reply(
            &mut relay,
            json!({"type": "error", "code": 401, "message": "unknown party"}),
        )
        .await;
        relay
    });

    assert_eq!(
        result.unwrap_err(),
        ChannelError::Rejected {
            code: 401,
            message: "unknown party".to_string(),
        }
    );
}

#[tokio::test]
async fn test_invalid_paths_are_not_sent() {
    let (listener, url) = listen().await;
    let (channel, _relay, _) = connect(&listener, &url).await;

    assert!(matches!(
        channel.write("calls/a.b", json!(1)).await,
        Err(ChannelError::InvalidPath(_))
    ));
    assert!(matches!(
        channel.remove("").await,
        Err(ChannelError::InvalidPath(_))
    ));
    assert!(matches!(
        channel.update("calls/bob", json!("scalar")).await,
        Err(ChannelError::WriteFailed(_))
    ));
    let (sink, _events) = recorder();
    assert!(matches!(
        channel.subscribe("calls/$bob", sink),
        Err(ChannelError::InvalidPath(_))
    ));
}
