//! Crypto Module - Ed25519 Identität
//!
//! Dieses Modul verwaltet die kryptographische Identität der lokalen Party:
//! - Generierung und persistente Speicherung des Schlüssels
//! - Ableitung der Party-ID aus dem Public Key
//! - Signierung der Frames an den Relay
//!

mod keypair;

pub use keypair::{KeyPair, KeyPairError};
