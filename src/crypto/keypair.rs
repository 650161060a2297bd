//! Ed25519 Identität für den Relay
//!
//! Jede Party signiert ihre Relay-Frames mit einem Ed25519-Schlüssel.
//! Der Private Key liegt im App-Datenverzeichnis oder unter einem
//! konfigurierten Pfad.
//!
//! ## Verwendung
//! ```no_run
//! use pulse_call::crypto::KeyPair;
//!
//! let keypair = KeyPair::load_or_create(None)?;
//! let party_id = keypair.party_id();
//! # Ok::<(), pulse_call::crypto::KeyPairError>(())
//! ```

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Failed to decode private key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid private key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

/// Ed25519 Schlüsselpaar einer Party
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt den Schlüssel von `path` (oder dem Standardpfad) bzw. legt ihn an
    pub fn load_or_create(path: Option<&Path>) -> Result<Self, KeyPairError> {
        let key_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(&key_path)?;
            Ok(keypair)
        }
    }

    /// Generiert ein neues zufälliges Schlüsselpaar
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Standardpfad: `<data_dir>/keys/private.key`
    pub fn default_path() -> Result<PathBuf, KeyPairError> {
        let dirs = directories::ProjectDirs::from("com", "pulse", "pulse-call")
            .ok_or(KeyPairError::NoDataDirectory)?;
        Ok(dirs.data_dir().join("keys").join("private.key"))
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyPairError::InvalidKeyLength(bytes.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        // Nur Owner darf lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Public Key als Base64 (wird beim Handshake übertragen)
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Aus dem Public Key abgeleitete Party-ID (pfadsicheres Base64)
    pub fn party_id(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signiert ein JSON-Frame.
    ///
    /// Signiert wird der kompakte JSON-String aller Felder außer `signature`,
    /// rekursiv alphabetisch sortiert.
    pub fn sign_message(&self, frame: &Value) -> String {
        let canonical = canonical_json(frame);
        let signature: Signature = self.signing_key.sign(canonical.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// Prüft die Signatur eines Frames gegen einen Public Key
    pub fn verify_message(public_key: &VerifyingKey, frame: &Value) -> bool {
        let Some(encoded) = frame.get("signature").and_then(Value::as_str) else {
            return false;
        };
        let Ok(bytes) = BASE64.decode(encoded) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };

        public_key
            .verify(canonical_json(frame).as_bytes(), &signature)
            .is_ok()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("party_id", &self.party_id())
            .finish()
    }
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted_without_signature(value)).unwrap_or_default()
}

fn sorted_without_signature(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sorted_without_signature(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_without_signature).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
