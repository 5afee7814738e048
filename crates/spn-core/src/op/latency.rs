//! Latency operation: a flushed ping/pong measuring round-trip time.
//!
//! Requires the crane-controller permission on the responding terminal so
//! arbitrary peers cannot use hubs as reflectors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::op::{OpAttachment, OpMsg, RemoteOpContext, ResultSlot};
use crate::terminal::Terminal;

/// Wire name of the latency operation.
pub const LATENCY_OP: &str = "latency";

/// Handle of a running latency probe.
pub struct LatencyHandle {
    result: oneshot::Receiver<std::result::Result<Duration, Error>>,
}

impl LatencyHandle {
    /// Wait for the measured round-trip time.
    pub async fn wait(self) -> Result<Duration> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(Error::TerminalEnded),
        }
    }
}

/// Start a latency probe on `terminal`.
pub async fn start(terminal: &Arc<Terminal>) -> Result<LatencyHandle> {
    let attachment = terminal.start_op(LATENCY_OP, Vec::new()).await?;
    let (slot, result) = ResultSlot::new();
    tokio::spawn(probe(attachment, slot));
    Ok(LatencyHandle { result })
}

async fn probe(attachment: OpAttachment, slot: Arc<ResultSlot<std::result::Result<Duration, Error>>>) {
    let OpAttachment {
        terminal,
        op_id,
        mut msgs,
    } = attachment;

    let nonce: [u8; 8] = rand::random();
    let sent_at = Instant::now();
    // Probes bypass batching in both directions; the measurement would
    // otherwise include the writer's hold-down timer.
    if let Err(err) = terminal.op_send(op_id, nonce.to_vec(), true).await {
        slot.fulfill(Err(err));
        return;
    }

    loop {
        match msgs.recv().await {
            None => {
                slot.fulfill(Err(Error::TerminalEnded));
                return;
            }
            Some(OpMsg::End(err)) => {
                slot.fulfill(Err(err.unwrap_or(Error::OpEnded)));
                return;
            }
            Some(OpMsg::Data(body)) => {
                if body.as_slice() != nonce {
                    let err = Error::Malformed("probe echo mismatch".into());
                    terminal.op_end(op_id, Some(&err)).await;
                    slot.fulfill(Err(err));
                    return;
                }
                let rtt = sent_at.elapsed();
                terminal.op_end(op_id, None).await;
                slot.fulfill(Ok(rtt));
                return;
            }
        }
    }
}

pub(crate) fn start_remote(ctx: RemoteOpContext) -> Result<()> {
    if !ctx.init.is_empty() {
        return Err(Error::Malformed("latency op takes no init data".into()));
    }
    let RemoteOpContext {
        terminal,
        op_id,
        mut msgs,
        ..
    } = ctx;
    tokio::spawn(async move {
        loop {
            match msgs.recv().await {
                Some(OpMsg::Data(body)) => {
                    if terminal.op_send(op_id, body, true).await.is_err() {
                        return;
                    }
                }
                Some(OpMsg::End(_)) | None => return,
            }
        }
    });
    Ok(())
}
