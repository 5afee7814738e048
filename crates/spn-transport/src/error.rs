//! Transport layer errors.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The link handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The underlying ship failed.
    #[error("ship failure: {0}")]
    Ship(String),

    /// Session or operation error from the terminal layer.
    #[error(transparent)]
    Terminal(#[from] spn_core::Error),

    /// Link crypto failure.
    #[error(transparent)]
    Crypto(#[from] spn_crypto::Error),
}
