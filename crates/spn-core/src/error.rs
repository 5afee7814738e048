//! Error taxonomy shared by terminals, operations and cranes.
//!
//! The numeric codes travel on the wire in OpEnd bodies and crane close
//! frames, so they are part of the peer contract and must stay stable.

use thiserror::Error;

/// Result type alias for terminal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds of the data plane.
///
/// Operation-level errors (`Malformed`, `PermissionDenied`, `Timeout`, …) end
/// a single operation; `TerminalEnded` ends every operation on a terminal;
/// `CraneTorn` ends every terminal on a crane. `OpEnded` is a non-error
/// sentinel telling a producer to stop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unexpected internal failure (0x01).
    #[error("internal failure: {0}")]
    Internal(String),

    /// Data could not be parsed or violated the protocol (0x02).
    #[error("malformed data: {0}")]
    Malformed(String),

    /// The terminal lacks the permission required by the operation (0x03).
    #[error("permission denied")]
    PermissionDenied,

    /// No operation of this type is registered (0x04).
    #[error("unknown operation type: {0}")]
    UnknownOpType(String),

    /// The local operation table cannot take another entry (0x05).
    #[error("operation table full")]
    OpTableFull,

    /// The terminal has ended; no further sends or operations (0x06).
    #[error("terminal ended")]
    TerminalEnded,

    /// The underlying crane failed; fatal to all its terminals (0x07).
    #[error("crane torn")]
    CraneTorn,

    /// No crane is assigned to the requested hub (0x08).
    #[error("hub unreachable: {0}")]
    HubUnreachable(String),

    /// A deadline elapsed (0x09).
    #[error("timed out")]
    Timeout,

    /// Sentinel: the operation finished and the producer should stop (0x0A).
    #[error("operation ended")]
    OpEnded,
}

impl Error {
    /// Numeric wire code of this error kind.
    pub fn wire_code(&self) -> u8 {
        match self {
            Error::Internal(_) => 0x01,
            Error::Malformed(_) => 0x02,
            Error::PermissionDenied => 0x03,
            Error::UnknownOpType(_) => 0x04,
            Error::OpTableFull => 0x05,
            Error::TerminalEnded => 0x06,
            Error::CraneTorn => 0x07,
            Error::HubUnreachable(_) => 0x08,
            Error::Timeout => 0x09,
            Error::OpEnded => 0x0A,
        }
    }

    /// Decode a wire code plus detail message.
    ///
    /// Code `0` means a clean end and decodes to `None`. Codes from newer
    /// peers decode to [`Error::Internal`] instead of failing.
    pub fn from_wire(code: u64, msg: String) -> Option<Error> {
        match code {
            0x00 => None,
            0x01 => Some(Error::Internal(msg)),
            0x02 => Some(Error::Malformed(msg)),
            0x03 => Some(Error::PermissionDenied),
            0x04 => Some(Error::UnknownOpType(msg)),
            0x05 => Some(Error::OpTableFull),
            0x06 => Some(Error::TerminalEnded),
            0x07 => Some(Error::CraneTorn),
            0x08 => Some(Error::HubUnreachable(msg)),
            0x09 => Some(Error::Timeout),
            0x0A => Some(Error::OpEnded),
            _ => Some(Error::Internal(format!("unknown error code {code}: {msg}"))),
        }
    }

    /// Detail message carried next to the wire code, if any.
    pub fn wire_message(&self) -> &str {
        match self {
            Error::Internal(msg) | Error::Malformed(msg) => msg,
            Error::UnknownOpType(name) => name,
            Error::HubUnreachable(hub) => hub,
            _ => "",
        }
    }

    /// Whether this value is the producer-stop sentinel rather than a fault.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Error::OpEnded)
    }
}
