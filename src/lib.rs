//! Pulse Call - P2P Call Signaling
//!
//! Baut direkte Media-Sessions zwischen zwei Parteien auf. Session
//! Descriptions und ICE-Candidates laufen über einen Realtime Keyed Store:
//! - `signaling`: Kanal-Abstraktion, In-Memory-Store und WebSocket-Relay
//! - `call_engine`: Zustandsmaschine, WebRTC- und cpal-Adapter
//! - `crypto`: Ed25519 Identität für signierte Relay-Frames
//! - `config`: Konfiguration aus Datei und Umgebung

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod signaling;

use anyhow::Context;
use call_engine::{CallSignalingEngine, CpalMediaSource, EngineConfig, WebRtcPeerFactory};
use config::AppConfig;
use crypto::KeyPair;
use once_cell::sync::OnceCell;
use signaling::{WsChannel, WsChannelConfig};
use std::sync::Arc;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installiert den tracing Subscriber (einmal pro Prozess).
///
/// `RUST_LOG` hat Vorrang vor `default_filter`.
pub fn init_logging(default_filter: &str) {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config::DEFAULT_LOG_FILTER));

        // Schlägt fehl, wenn bereits ein globaler Subscriber gesetzt ist
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// CALL APP
// ============================================================================

/// Verdrahtet Identität, Relay, WebRTC und Audio zu einer Engine
pub struct CallApp {
    config: AppConfig,
    keypair: Arc<KeyPair>,
    channel: Arc<WsChannel>,
    engine: CallSignalingEngine,
}

impl CallApp {
    /// Lädt den Schlüssel, verbindet zum Relay und startet die Engine
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        init_logging(&config.log_filter);
        config.validate().context("Invalid configuration")?;

        tracing::info!("Initializing Pulse Call...");

        let keypair = KeyPair::load_or_create(config.key_path.as_deref())
            .context("Failed to load keypair")?;
        tracing::info!("Loaded keypair: {:?}", keypair);
        let keypair = Arc::new(keypair);

        let party_id = config
            .party_id
            .clone()
            .unwrap_or_else(|| keypair.party_id());

        let channel = WsChannel::connect(
            WsChannelConfig {
                url: config.websocket_url()?.to_string(),
                party_id: party_id.clone(),
                connect_timeout: config.connect_timeout(),
                write_timeout: config.write_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
            },
            Arc::clone(&keypair),
        )
        .await
        .context("Failed to connect to signaling relay")?;

        let engine = CallSignalingEngine::new(
            EngineConfig {
                local_party_id: party_id.clone(),
                local_party_name: config.display_name.clone(),
                decline_when_busy: config.decline_when_busy,
                disconnect_grace: config.disconnect_grace(),
            },
            Arc::clone(&channel) as Arc<dyn signaling::RealtimeChannel>,
            Arc::new(WebRtcPeerFactory::new(&config.ice_servers)),
            Arc::new(CpalMediaSource::new()),
        );
        engine.start().context("Failed to listen for incoming calls")?;

        tracing::info!("Ready as {}", party_id);

        Ok(Self {
            config,
            keypair,
            channel,
            engine,
        })
    }

    pub fn engine(&self) -> &CallSignalingEngine {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Public Key als Base64
    pub fn public_key(&self) -> String {
        self.keypair.public_key_base64()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Legt auf und trennt die Verbindung zum Relay
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.channel.disconnect();
        tracing::info!("Pulse Call shut down");
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("party_id", &self.engine.local_party_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
