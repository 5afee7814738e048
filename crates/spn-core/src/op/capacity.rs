//! Capacity operation: flood a fixed volume and measure bits per second.
//!
//! The responder streams `volume` bytes in `msg_size` chunks and finishes
//! with an empty fin message; the initiator measures from the first chunk
//! to the fin. Throughput is intentionally bounded by the terminal's flow
//! queue window, so the result reflects the live credit-limited path rather
//! than the raw link. Requires `IsCraneController` on the responder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::op::{OpAttachment, OpMsg, RemoteOpContext, ResultSlot};
use crate::terminal::Terminal;
use crate::wire;

/// Wire name of the capacity operation.
pub const CAPACITY_OP: &str = "capacity";

/// Largest chunk size a peer may request.
const MAX_MSG_SIZE: usize = 65536;

/// Parameters of a capacity test.
#[derive(Debug, Clone)]
pub struct CapacityOptions {
    /// Total bytes the responder floods.
    pub volume: usize,
    /// Deadline for the whole measurement.
    pub max_time: Duration,
    /// Chunk size of individual messages.
    pub msg_size: usize,
}

impl Default for CapacityOptions {
    fn default() -> Self {
        Self {
            volume: 1 << 20,
            max_time: Duration::from_secs(10),
            msg_size: 1000,
        }
    }
}

impl CapacityOptions {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(15);
        wire::put_varint(&mut buf, self.volume as u64);
        wire::put_varint(&mut buf, self.max_time.as_millis() as u64);
        wire::put_varint(&mut buf, self.msg_size as u64);
        buf
    }

    fn parse(init: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let volume = wire::read_varint(init, &mut offset)? as usize;
        let max_millis = wire::read_varint(init, &mut offset)?;
        let msg_size = wire::read_varint(init, &mut offset)? as usize;
        if offset != init.len() {
            return Err(Error::Malformed("trailing bytes in capacity init".into()));
        }
        if volume == 0 || max_millis == 0 {
            return Err(Error::Malformed("capacity test without volume or time".into()));
        }
        if msg_size == 0 || msg_size > MAX_MSG_SIZE {
            return Err(Error::Malformed(format!("chunk size {msg_size} out of range")));
        }
        Ok(Self {
            volume,
            max_time: Duration::from_millis(max_millis),
            msg_size,
        })
    }
}

/// Handle of a running capacity test.
pub struct CapacityHandle {
    result: oneshot::Receiver<std::result::Result<u64, Error>>,
}

impl CapacityHandle {
    /// Wait for the measured rate in bits per second.
    pub async fn wait(self) -> Result<u64> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(Error::TerminalEnded),
        }
    }
}

/// Start a capacity test on `terminal`.
pub async fn start(terminal: &Arc<Terminal>, opts: CapacityOptions) -> Result<CapacityHandle> {
    let deadline = Instant::now() + opts.max_time;
    let attachment = terminal.start_op(CAPACITY_OP, opts.encode()).await?;
    let (slot, result) = ResultSlot::new();
    tokio::spawn(measure(attachment, deadline, slot));
    Ok(CapacityHandle { result })
}

async fn measure(
    attachment: OpAttachment,
    deadline: Instant,
    slot: Arc<ResultSlot<std::result::Result<u64, Error>>>,
) {
    let OpAttachment {
        terminal,
        op_id,
        mut msgs,
    } = attachment;
    let mut started: Option<Instant> = None;
    let mut bytes: u64 = 0;

    loop {
        let msg = match tokio::time::timeout_at(deadline, msgs.recv()).await {
            Ok(msg) => msg,
            Err(_) => {
                let err = Error::Timeout;
                terminal.op_end(op_id, Some(&err)).await;
                slot.fulfill(Err(err));
                return;
            }
        };
        match msg {
            None => {
                slot.fulfill(Err(Error::TerminalEnded));
                return;
            }
            Some(OpMsg::End(err)) => {
                slot.fulfill(Err(err.unwrap_or(Error::OpEnded)));
                return;
            }
            Some(OpMsg::Data(body)) if body.is_empty() => {
                // fin marker
                let Some(started) = started else {
                    let err = Error::Malformed("capacity fin before any data".into());
                    terminal.op_end(op_id, Some(&err)).await;
                    slot.fulfill(Err(err));
                    return;
                };
                let elapsed = started.elapsed().max(Duration::from_micros(1));
                let bits_per_second = (bytes as f64 * 8.0 / elapsed.as_secs_f64()) as u64;
                terminal.op_end(op_id, None).await;
                slot.fulfill(Ok(bits_per_second));
                return;
            }
            Some(OpMsg::Data(body)) => {
                if started.is_none() {
                    started = Some(Instant::now());
                }
                bytes += body.len() as u64;
            }
        }
    }
}

pub(crate) fn start_remote(ctx: RemoteOpContext) -> Result<()> {
    let opts = CapacityOptions::parse(&ctx.init)?;
    let RemoteOpContext {
        terminal,
        op_id,
        mut msgs,
        ..
    } = ctx;
    tokio::spawn(async move {
        let mut remaining = opts.volume;
        while remaining > 0 {
            let n = remaining.min(opts.msg_size);
            if terminal.op_send(op_id, vec![0x55; n], false).await.is_err() {
                return;
            }
            remaining -= n;
        }
        if terminal.op_send(op_id, Vec::new(), true).await.is_err() {
            return;
        }
        // Hold the op open until the initiator publishes its measurement.
        loop {
            match msgs.recv().await {
                Some(OpMsg::Data(_)) => {}
                Some(OpMsg::End(_)) | None => return,
            }
        }
    });
    Ok(())
}
