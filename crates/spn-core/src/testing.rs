//! In-process test support: wired terminal pairs and a static authority.
//!
//! The pair helpers connect two terminals through their crane-facing frame
//! queues with a configurable one-way delay, which is enough to exercise
//! flow control, ordering and the probe operations without a crane or ship.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::link::{FrameSender, OutFrame};
use crate::op::authorize::AccessAuthority;
use crate::permission::Permissions;
use crate::terminal::{Terminal, TerminalOptions};
use crate::wire::{self, InitialData};

/// An access authority that grants a fixed permission set to any non-empty
/// token.
pub struct TestAuthority {
    /// Bits granted on successful authorization.
    pub grant: Permissions,
}

#[async_trait]
impl AccessAuthority for TestAuthority {
    async fn authorize(&self, token: &[u8]) -> Result<Permissions> {
        if token.is_empty() {
            return Err(Error::PermissionDenied);
        }
        Ok(self.grant)
    }
}

/// Create two terminals wired directly to each other with a one-way delay.
pub fn terminal_pair(delay: Duration, opts: &TerminalOptions) -> (Arc<Terminal>, Arc<Terminal>) {
    let (a, b, _tap_a, _tap_b) = terminal_pair_tapped(delay, opts);
    (a, b)
}

/// Like [`terminal_pair`], additionally copying every frame each terminal
/// submits into per-direction taps for wire-level assertions.
pub fn terminal_pair_tapped(
    delay: Duration,
    opts: &TerminalOptions,
) -> (
    Arc<Terminal>,
    Arc<Terminal>,
    mpsc::UnboundedReceiver<OutFrame>,
    mpsc::UnboundedReceiver<OutFrame>,
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let (tap_a_tx, tap_a_rx) = mpsc::unbounded_channel();
    let (tap_b_tx, tap_b_rx) = mpsc::unbounded_channel();
    let root = CancellationToken::new();

    let (a, _init) = Terminal::create(1, "test-a", opts, FrameSender::new(1, a_tx), &root);
    a.mark_established();
    let init = InitialData {
        version: wire::WIRE_VERSION,
        queue_size: opts.queue_size,
        expanded: false,
    };
    let b = Terminal::accept(1, "test-b", &init, FrameSender::new(1, b_tx), &root);

    pump(a_rx, b.clone(), delay, Some(tap_a_tx));
    pump(b_rx, a.clone(), delay, Some(tap_b_tx));
    (a, b, tap_a_rx, tap_b_rx)
}

/// Move frames from an outbound queue into a destination terminal after a
/// fixed delay, preserving order.
fn pump(
    mut rx: mpsc::UnboundedReceiver<OutFrame>,
    dest: Arc<Terminal>,
    delay: Duration,
    tap: Option<mpsc::UnboundedSender<OutFrame>>,
) {
    let (stamp_tx, mut stamp_rx) = mpsc::unbounded_channel::<(Instant, Vec<u8>)>();

    // Stage one only stamps, so a slow consumer cannot skew arrival times.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Some(tap) = &tap {
                let _ = tap.send(OutFrame {
                    terminal_id: frame.terminal_id,
                    body: frame.body.clone(),
                    flush: frame.flush,
                });
            }
            if stamp_tx.send((Instant::now() + delay, frame.body)).is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        while let Some((at, body)) = stamp_rx.recv().await {
            tokio::time::sleep_until(at).await;
            if body.is_empty() {
                // flush markers carry no payload
                continue;
            }
            if let Err(err) = dest.deliver(body) {
                dest.end("delivery failed", Some(err));
                return;
            }
        }
    });
}
