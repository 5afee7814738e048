//! Crane multiplexer, ships and expansion for the SPN data plane.
//!
//! A crane owns one ship (an ordered bidirectional blob transport), runs
//! the link handshake and optional encryption, and multiplexes terminals
//! over it. The crane-by-hub registry and the expand operation build
//! multi-hop terminal chains on top.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use spn_core::op::registry::OpRegistry;
use spn_core::Permissions;

pub mod crane;
pub mod error;
pub mod expand;
pub mod registry;
pub mod ship;

pub use crane::{Crane, CraneOptions, CraneState, HubId, RemoteHub};
pub use error::{Error, Result};
pub use expand::expand_to;
pub use ship::{Ship, TestShip};

/// Install the process-wide op registry with the built-in operations plus
/// expansion. Call once during startup; a registry installed earlier wins.
pub fn install_default_ops() {
    let mut ops = OpRegistry::builtin();
    ops.register(
        expand::EXPAND_OP,
        Permissions::IS_AUTHENTICATED,
        Arc::new(expand::start_remote),
    );
    if spn_core::op::registry::install(ops).is_err() {
        tracing::trace!("op registry already installed");
    }
}
