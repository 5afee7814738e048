//! Cryptographic primitives for the SPN data plane.
//!
//! This crate covers the crane's link security:
//! - Hub identities (Ed25519) used to authenticate handshake responders
//! - The link key exchange (ephemeral X25519 + HKDF-SHA256)
//! - Link AEAD (ChaCha20-Poly1305) with per-direction counter nonces
//!
//! All secrets are wrapped in `Zeroizing` and no key material is logged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod identity;
pub mod kex;

pub use aead::LinkCipher;
pub use error::{Error, Result};
pub use identity::Identity;
pub use kex::{LinkKeyExchange, SessionSecret};
