//! Long-lived hub identities.
//!
//! A hub's identity is an Ed25519 keypair. The public half is published in
//! the hub catalog; the private half signs handshake transcripts so a crane
//! controller can verify it reached the hub it routed to. Controllers never
//! sign anything, which keeps clients anonymous at the link layer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Length of an identity signature on the wire.
pub const SIGNATURE_LEN: usize = 64;

/// A long-lived hub identity.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The public key peers verify against.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify an identity signature.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let signature: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| Error::Signature)?;
    key.verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| Error::Signature)
}
