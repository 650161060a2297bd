//! Konfiguration
//!
//! `AppConfig` wird aus einer optionalen JSON-Datei (`PULSE_CONFIG`) gelesen
//! und danach von Umgebungsvariablen überschrieben.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Signaling Server URL
pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:3000";

/// Standard Log-Filter, falls `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// ICE SERVER
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Google STUN Server (kostenlos, für die meisten Verbindungen ausreichend)
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// HTTP(S)- oder WS(S)-URL des Relay-Servers
    pub signaling_url: String,
    /// Eigene Party-ID; ohne Angabe aus dem Public Key abgeleitet
    pub party_id: Option<String>,
    pub display_name: String,
    pub ice_servers: Vec<IceServer>,
    /// Angebote während eines laufenden Anrufs aktiv ablehnen
    pub decline_when_busy: bool,
    pub disconnect_grace_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Pfad des Private Keys; ohne Angabe im App-Datenverzeichnis
    pub key_path: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            party_id: None,
            display_name: "Anonymous".to_string(),
            ice_servers: default_ice_servers(),
            decline_when_busy: true,
            disconnect_grace_ms: 5_000,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            key_path: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Liest `PULSE_CONFIG` (falls gesetzt) und wendet Umgebungsvariablen an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PULSE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Überschreibt Felder aus einer Variablen-Quelle
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(party_id) = var("PULSE_PARTY_ID").filter(|v| !v.is_empty()) {
            self.party_id = Some(party_id);
        }
        if let Some(name) = var("PULSE_DISPLAY_NAME").filter(|v| !v.is_empty()) {
            self.display_name = name;
        }

        // Optionaler TURN Server
        if let Some(turn_url) = var("PULSE_TURN_URL").filter(|v| !v.is_empty()) {
            self.ice_servers.push(IceServer {
                urls: vec![turn_url],
                username: var("PULSE_TURN_USERNAME"),
                credential: var("PULSE_TURN_CREDENTIAL"),
            });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket_url()?;

        if let Some(party_id) = &self.party_id {
            crate::signaling::split_path(party_id)
                .ok()
                .filter(|segments| segments.len() == 1)
                .ok_or_else(|| ConfigError::Invalid(format!("party id {party_id:?}")))?;
        }
        if self.disconnect_grace_ms == 0 {
            return Err(ConfigError::Invalid("disconnectGraceMs must be > 0".into()));
        }
        Ok(())
    }

    /// WebSocket-URL des Relays (`http` → `ws`, Pfad `/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.signaling_url)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(self.signaling_url.clone()))?;

        if !url.path().trim_end_matches('/').ends_with("/ws") {
            let path = format!("{}/ws", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================
