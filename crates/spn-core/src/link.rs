//! Hand-off between terminals and the crane writer.
//!
//! A crane hands every terminal a [`FrameSender`] bound to its terminal id.
//! Submissions land in the crane's unbounded outbound queue and never block;
//! boundedness comes from the flow-queue credits above this layer.

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// One outbound submission to a crane writer.
#[derive(Debug)]
pub struct OutFrame {
    /// Terminal the body belongs to (0 for crane control).
    pub terminal_id: u32,
    /// Payload; empty bodies carry no frame and only act as flush markers.
    pub body: Vec<u8>,
    /// Whether the writer must flush immediately instead of batching.
    pub flush: bool,
}

/// A terminal's non-blocking path into a crane's outbound queue.
#[derive(Debug, Clone)]
pub struct FrameSender {
    terminal_id: u32,
    tx: mpsc::UnboundedSender<OutFrame>,
}

impl FrameSender {
    /// Bind a sender to a terminal id on the given crane queue.
    pub fn new(terminal_id: u32, tx: mpsc::UnboundedSender<OutFrame>) -> Self {
        Self { terminal_id, tx }
    }

    /// Terminal id submissions are tagged with.
    pub fn terminal_id(&self) -> u32 {
        self.terminal_id
    }

    /// Queue a payload for the crane writer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::CraneTorn`] once the crane writer is gone.
    pub fn submit(&self, body: Vec<u8>, flush: bool) -> Result<()> {
        self.tx
            .send(OutFrame {
                terminal_id: self.terminal_id,
                body,
                flush,
            })
            .map_err(|_| Error::CraneTorn)
    }
}
