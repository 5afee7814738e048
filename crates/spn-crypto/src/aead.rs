//! Link AEAD: ChaCha20-Poly1305 with per-direction counter nonces.
//!
//! Each ship load is sealed as one record. Nonces are never transmitted;
//! both ends keep a monotonically increasing counter per direction:
//!
//! ```text
//! nonce[0]    = direction (0 = controller to responder, 1 = reverse)
//! nonce[1:4]  = zero
//! nonce[4:12] = counter, little-endian
//! ```
//!
//! The handshake transcript hash is the associated data, binding every
//! record to the key exchange it came from. A record that fails to open is
//! fatal to the crane; the counters are useless after a gap anyway.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{Error, Result};
use crate::kex::SessionSecret;

/// Authentication tag length appended to every sealed record.
pub const TAG_LEN: usize = 16;

/// Build a link nonce from a direction byte and a record counter.
///
/// # Example
///
/// ```
/// use spn_crypto::aead::construct_nonce;
///
/// let nonce = construct_nonce(1, 0x4746454443424140);
/// assert_eq!(nonce[0], 1);
/// assert_eq!(&nonce[1..4], &[0, 0, 0]);
/// assert_eq!(&nonce[4..12], &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
/// ```
pub fn construct_nonce(direction: u8, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    // nonce[1:4] stays zero
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Sealing/opening state of one crane link.
pub struct LinkCipher {
    cipher: ChaCha20Poly1305,
    aad: [u8; 32],
    seal_direction: u8,
    seal_counter: u64,
    open_counter: u64,
}

impl LinkCipher {
    /// Create the cipher for one end of a link.
    pub fn new(secret: &SessionSecret, controller: bool) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(secret.key.as_ref())),
            aad: secret.transcript,
            seal_direction: if controller { 0 } else { 1 },
            seal_counter: 0,
            open_counter: 0,
        }
    }

    /// Seal an outbound record, consuming the next send nonce.
    ///
    /// # Example
    ///
    /// ```
    /// use spn_crypto::aead::{LinkCipher, TAG_LEN};
    /// use spn_crypto::kex::SessionSecret;
    /// use zeroize::Zeroizing;
    ///
    /// let secret = SessionSecret {
    ///     key: Zeroizing::new([0x42; 32]),
    ///     transcript: [0x07; 32],
    /// };
    /// let mut controller = LinkCipher::new(&secret, true);
    /// let mut responder = LinkCipher::new(&secret, false);
    ///
    /// let sealed = controller.seal(b"frame").unwrap();
    /// assert_eq!(sealed.len(), b"frame".len() + TAG_LEN);
    /// assert_eq!(responder.open(&sealed).unwrap(), b"frame");
    /// ```
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = construct_nonce(self.seal_direction, self.seal_counter);
        self.seal_counter += 1;
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| Error::Seal("link record encryption failed".into()))
    }

    /// Open an inbound record, consuming the next receive nonce.
    ///
    /// # Errors
    ///
    /// Any failure means the link lost a record or was tampered with; the
    /// caller must tear the crane down. The receive counter only advances
    /// on success.
    ///
    /// # Example
    ///
    /// ```
    /// use spn_crypto::aead::LinkCipher;
    /// use spn_crypto::kex::SessionSecret;
    /// use zeroize::Zeroizing;
    ///
    /// let secret = SessionSecret {
    ///     key: Zeroizing::new([0x42; 32]),
    ///     transcript: [0x07; 32],
    /// };
    /// let mut controller = LinkCipher::new(&secret, true);
    /// let mut responder = LinkCipher::new(&secret, false);
    ///
    /// let sealed = controller.seal(b"frame").unwrap();
    /// // reflecting a record back at its sender fails: wrong direction
    /// assert!(controller.open(&sealed).is_err());
    /// assert_eq!(responder.open(&sealed).unwrap(), b"frame");
    /// ```
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        let nonce = construct_nonce(1 - self.seal_direction, self.open_counter);
        let opened = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: &self.aad,
                },
            )
            .map_err(|_| Error::Open("link record authentication failed".into()))?;
        self.open_counter += 1;
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::kex::{respond, LinkKeyExchange};

    fn link_pair() -> (LinkCipher, LinkCipher) {
        let identity = Identity::generate();
        let (kx, init) = LinkKeyExchange::initiate();
        let (ack, responder) = respond(&identity, &init).unwrap();
        let controller = kx.finalize(&ack, &identity.verifying_key()).unwrap();
        (
            LinkCipher::new(&controller, true),
            LinkCipher::new(&responder, false),
        )
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = construct_nonce(1, 0x4746_4544_4342_4140);
        assert_eq!(nonce[0], 1);
        assert_eq!(&nonce[1..4], &[0, 0, 0]);
        assert_eq!(&nonce[4..12], &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
    }

    #[test]
    fn test_records_flow_both_directions() {
        let (mut controller, mut responder) = link_pair();

        for i in 0..5u8 {
            let sealed = controller.seal(&[i; 32]).unwrap();
            assert_eq!(responder.open(&sealed).unwrap(), vec![i; 32]);

            let sealed = responder.seal(&[i ^ 0xFF; 8]).unwrap();
            assert_eq!(controller.open(&sealed).unwrap(), vec![i ^ 0xFF; 8]);
        }
    }

    #[test]
    fn test_lost_record_breaks_the_link() {
        let (mut controller, mut responder) = link_pair();
        let _lost = controller.seal(b"first").unwrap();
        let second = controller.seal(b"second").unwrap();
        // the responder expects counter 0, the record was sealed with 1
        assert!(responder.open(&second).is_err());
    }

    #[test]
    fn test_direction_confusion_is_rejected() {
        let (mut controller, mut responder) = link_pair();
        let sealed = controller.seal(b"frame").unwrap();
        // reflecting a record back at its sender must fail
        assert!(controller.open(&sealed).is_err());
        assert_eq!(responder.open(&sealed).unwrap(), b"frame");
    }

    #[test]
    fn test_tampered_record_is_rejected() {
        let (mut controller, mut responder) = link_pair();
        let mut sealed = controller.seal(b"frame").unwrap();
        sealed[2] ^= 0x01;
        assert!(responder.open(&sealed).is_err());
    }
}
