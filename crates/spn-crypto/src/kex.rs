//! Link key exchange for encrypted cranes.
//!
//! One round trip derives a shared session key:
//!
//! ```text
//! controller -> responder: eph_c               (32 bytes)
//! responder -> controller: eph_r | sig         (32 + 64 bytes)
//!
//! transcript   = SHA-256(eph_c | eph_r)
//! sig          = Ed25519-sign(identity, transcript)
//! session_key  = HKDF-SHA256(ikm = X25519(eph, eph), salt = transcript,
//!                            info = "spn-crane-link-v1")
//! ```
//!
//! Only the responder authenticates: the controller verifies the signature
//! against the hub catalog key, while the responder learns nothing about
//! who dialed it. Ephemeral secrets are consumed by the exchange and the
//! derived key is wrapped in `Zeroizing`.

use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::identity::{self, Identity, SIGNATURE_LEN};

/// Length of the controller's opening message.
pub const KX_INIT_LEN: usize = 32;

/// Length of the responder's reply.
pub const KX_ACK_LEN: usize = 32 + SIGNATURE_LEN;

const KEY_INFO: &[u8] = b"spn-crane-link-v1";

/// The derived link secret plus the transcript hash binding it.
pub struct SessionSecret {
    /// Symmetric link key.
    pub key: Zeroizing<[u8; 32]>,
    /// SHA-256 over both ephemeral keys; doubles as the AEAD context.
    pub transcript: [u8; 32],
}

/// Controller-side state of an in-flight key exchange.
pub struct LinkKeyExchange {
    secret: EphemeralSecret,
    init_msg: [u8; KX_INIT_LEN],
}

impl LinkKeyExchange {
    /// Open an exchange; returns the state and the message to send.
    pub fn initiate() -> (Self, [u8; KX_INIT_LEN]) {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let init_msg = PublicKey::from(&secret).to_bytes();
        (Self { secret, init_msg }, init_msg)
    }

    /// Consume the responder's reply and derive the session secret.
    ///
    /// # Errors
    ///
    /// Fails when the reply is malformed or the identity signature does not
    /// match `peer_key`.
    pub fn finalize(
        self,
        ack: &[u8],
        peer_key: &ed25519_dalek::VerifyingKey,
    ) -> Result<SessionSecret> {
        if ack.len() != KX_ACK_LEN {
            return Err(Error::KeyExchange(format!(
                "responder message has {} bytes, expected {KX_ACK_LEN}",
                ack.len()
            )));
        }
        let mut peer_eph = [0u8; 32];
        peer_eph.copy_from_slice(&ack[..32]);
        let transcript = transcript_hash(&self.init_msg, &peer_eph);
        identity::verify(peer_key, &transcript, &ack[32..])?;
        derive(self.secret, &peer_eph, transcript)
    }
}

/// Responder side: answer `init` and derive the session secret.
pub fn respond(identity: &Identity, init: &[u8]) -> Result<(Vec<u8>, SessionSecret)> {
    if init.len() != KX_INIT_LEN {
        return Err(Error::KeyExchange(format!(
            "controller message has {} bytes, expected {KX_INIT_LEN}",
            init.len()
        )));
    }
    let mut peer_eph = [0u8; 32];
    peer_eph.copy_from_slice(init);

    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let own_eph = PublicKey::from(&secret).to_bytes();
    let transcript = transcript_hash(&peer_eph, &own_eph);

    let mut ack = Vec::with_capacity(KX_ACK_LEN);
    ack.extend_from_slice(&own_eph);
    ack.extend_from_slice(&identity.sign(&transcript));

    let session = derive(secret, &peer_eph, transcript)?;
    Ok((ack, session))
}

fn transcript_hash(controller_eph: &[u8; 32], responder_eph: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(controller_eph);
    hasher.update(responder_eph);
    hasher.finalize().into()
}

fn derive(secret: EphemeralSecret, peer_eph: &[u8; 32], transcript: [u8; 32]) -> Result<SessionSecret> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_eph));
    if !shared.was_contributory() {
        return Err(Error::KeyExchange("low-order peer key".into()));
    }
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&transcript), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_INFO, key.as_mut())
        .map_err(|_| Error::KeyExchange("key expansion failed".into()))?;
    Ok(SessionSecret { key, transcript })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let identity = Identity::generate();
        let (kx, init) = LinkKeyExchange::initiate();
        let (ack, responder) = respond(&identity, &init).unwrap();
        let controller = kx.finalize(&ack, &identity.verifying_key()).unwrap();

        assert_eq!(*controller.key, *responder.key);
        assert_eq!(controller.transcript, responder.transcript);
    }

    #[test]
    fn test_wrong_identity_is_rejected() {
        let identity = Identity::generate();
        let expected = Identity::generate();
        let (kx, init) = LinkKeyExchange::initiate();
        let (ack, _) = respond(&identity, &init).unwrap();
        assert!(matches!(
            kx.finalize(&ack, &expected.verifying_key()),
            Err(Error::Signature)
        ));
    }

    #[test]
    fn test_tampered_ack_is_rejected() {
        let identity = Identity::generate();
        let (kx, init) = LinkKeyExchange::initiate();
        let (mut ack, _) = respond(&identity, &init).unwrap();
        ack[0] ^= 0xFF;
        assert!(kx.finalize(&ack, &identity.verifying_key()).is_err());
    }

    #[test]
    fn test_short_messages_are_rejected() {
        let identity = Identity::generate();
        assert!(respond(&identity, &[0u8; 16]).is_err());

        let (kx, _) = LinkKeyExchange::initiate();
        assert!(kx.finalize(&[0u8; 40], &identity.verifying_key()).is_err());
    }
}
