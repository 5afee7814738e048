//! Crypto layer errors.

use thiserror::Error;

/// Result type alias for crypto operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Crypto layer failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Key exchange material was malformed or invalid.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// The responder's identity signature did not verify.
    #[error("identity signature invalid")]
    Signature,

    /// Sealing a frame failed.
    #[error("seal failed: {0}")]
    Seal(String),

    /// Opening a frame failed; fatal to the link.
    #[error("open failed: {0}")]
    Open(String),
}
