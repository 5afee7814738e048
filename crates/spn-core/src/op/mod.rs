//! Operation machinery: typed, bounded message exchanges on a terminal.
//!
//! An operation is created locally through [`Terminal::start_op`] or
//! remotely when an OpStart frame arrives and the registry yields a start
//! function for its type name. Either way the operation's worker owns an
//! inbound [`OpMsg`] channel filled by the terminal dispatcher and talks
//! back through [`Terminal::op_send`] / [`Terminal::op_end`]. Every
//! operation publishes exactly one result on a single-shot channel.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::terminal::Terminal;

pub mod authorize;
pub mod capacity;
pub mod counter;
pub mod latency;
pub mod registry;

/// A message routed to an operation by the terminal dispatcher.
#[derive(Debug)]
pub enum OpMsg {
    /// OpData payload from the peer.
    Data(Vec<u8>),
    /// The peer (or the terminal) ended the operation; `None` is clean.
    End(Option<crate::Error>),
}

/// A locally started operation's connection to its terminal.
pub struct OpAttachment {
    /// The hosting terminal.
    pub terminal: Arc<Terminal>,
    /// Allocated operation id.
    pub op_id: u32,
    /// Inbound messages, filled by the terminal dispatcher.
    pub msgs: mpsc::Receiver<OpMsg>,
}

/// Context handed to a registered start function for a remote OpStart.
pub struct RemoteOpContext {
    /// The hosting terminal.
    pub terminal: Arc<Terminal>,
    /// Operation id chosen by the peer.
    pub op_id: u32,
    /// Opaque init data from the OpStart frame.
    pub init: Vec<u8>,
    /// Inbound messages, filled by the terminal dispatcher.
    pub msgs: mpsc::Receiver<OpMsg>,
}

/// Single-shot result slot shared between an operation's workers.
///
/// The first fulfillment wins; later ones are dropped, which is what makes
/// "ended exactly once by either side or by teardown" cheap to uphold.
pub(crate) struct ResultSlot<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T: Send> ResultSlot<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn fulfill(&self, value: T) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(value);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.tx.lock().is_none()
    }
}
