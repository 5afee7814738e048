//! Session, flow-control and operation engine of the SPN data plane.
//!
//! This crate implements the terminal layer of the overlay network:
//! - Wire codecs for terminal payloads and flow-control frames
//! - The Duplex Flow Queue (credit-based back-pressure inside a terminal)
//! - Terminal sessions with their operation tables and permission checks
//! - The built-in operations (counter, latency, capacity, authorize)
//!
//! Link multiplexing and encryption live in `spn-transport` and `spn-crypto`;
//! this crate only hands framed payloads to a submitter and receives them back
//! through [`Terminal::deliver`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dfq;
pub mod error;
pub mod link;
pub mod op;
pub mod permission;
pub mod terminal;
pub mod testing;
pub mod wire;

pub use dfq::DuplexFlowQueue;
pub use error::{Error, Result};
pub use link::{FrameSender, OutFrame};
pub use permission::Permissions;
pub use terminal::{Terminal, TerminalEnd, TerminalOptions, TerminalState};
