//! Counter operation: both sides count up and verify strict ordering.
//!
//! Each message carries `varint(n)` where `n` is the sender's next count.
//! The receiver requires the stream to be exactly `+1` monotonic, which
//! makes the op a cheap end-to-end check of in-order delivery, flow control
//! and throughput. The initiator emits the clean OpEnd once both directions
//! have reached their targets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::op::{OpAttachment, OpMsg, RemoteOpContext, ResultSlot};
use crate::terminal::Terminal;
use crate::wire;

/// Wire name of the counter operation.
pub const COUNTER_OP: &str = "counter";

/// Counter targets. `client_count_to` is the stream from initiator to
/// acceptor, `server_count_to` the reverse; zero disables a direction.
#[derive(Debug, Clone, Default)]
pub struct CounterOptions {
    /// Messages the initiator sends.
    pub client_count_to: u64,
    /// Messages the acceptor sends.
    pub server_count_to: u64,
    /// Flush after every message (local behavior, not on the wire).
    pub flush: bool,
}

impl CounterOptions {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10);
        wire::put_varint(&mut buf, self.client_count_to);
        wire::put_varint(&mut buf, self.server_count_to);
        buf
    }

    fn parse(init: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let client_count_to = wire::read_varint(init, &mut offset)?;
        let server_count_to = wire::read_varint(init, &mut offset)?;
        if offset != init.len() {
            return Err(Error::Malformed("trailing bytes in counter init".into()));
        }
        Ok(Self {
            client_count_to,
            server_count_to,
            flush: false,
        })
    }
}

struct CounterShared {
    sent: AtomicU64,
    received: AtomicU64,
    send_to: u64,
    recv_to: u64,
    completing: AtomicBool,
}

/// Handle of a running counter op.
pub struct CounterHandle {
    result: oneshot::Receiver<Option<Error>>,
    shared: Arc<CounterShared>,
}

impl CounterHandle {
    /// Wait for the op's single result. Only the first wait observes it.
    pub async fn wait(&mut self) -> Result<()> {
        match (&mut self.result).await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(Error::TerminalEnded),
        }
    }

    /// Messages sent so far.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Messages received so far.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }
}

/// Start a counter op on `terminal`.
pub async fn start(terminal: &Arc<Terminal>, opts: CounterOptions) -> Result<CounterHandle> {
    let attachment = terminal.start_op(COUNTER_OP, opts.encode()).await?;
    Ok(run(
        attachment,
        opts.client_count_to,
        opts.server_count_to,
        opts.flush,
        true,
    ))
}

pub(crate) fn start_remote(ctx: RemoteOpContext) -> Result<()> {
    let opts = CounterOptions::parse(&ctx.init)?;
    let attachment = OpAttachment {
        terminal: ctx.terminal,
        op_id: ctx.op_id,
        msgs: ctx.msgs,
    };
    // Targets swap sides: our send stream is the peer's receive stream.
    run(
        attachment,
        opts.server_count_to,
        opts.client_count_to,
        false,
        false,
    );
    Ok(())
}

fn run(
    attachment: OpAttachment,
    send_to: u64,
    recv_to: u64,
    flush: bool,
    initiator: bool,
) -> CounterHandle {
    let OpAttachment {
        terminal,
        op_id,
        mut msgs,
    } = attachment;
    let (slot, result) = ResultSlot::new();
    let shared = Arc::new(CounterShared {
        sent: AtomicU64::new(0),
        received: AtomicU64::new(0),
        send_to,
        recv_to,
        completing: AtomicBool::new(false),
    });

    // Sending and receiving run as separate workers so a full-duplex flood
    // cannot deadlock on its own back-pressure.
    if send_to > 0 {
        let terminal = terminal.clone();
        let shared = shared.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            for n in 1..=send_to {
                if slot.is_done() {
                    return;
                }
                let mut body = Vec::with_capacity(10);
                wire::put_varint(&mut body, n);
                if let Err(err) = terminal.op_send(op_id, body, flush).await {
                    slot.fulfill(Some(err));
                    return;
                }
                shared.sent.store(n, Ordering::Release);
            }
            maybe_complete(&shared, &terminal, op_id, initiator, &slot).await;
        });
    }

    {
        let terminal = terminal.clone();
        let shared = shared.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            loop {
                match msgs.recv().await {
                    None => {
                        slot.fulfill(Some(Error::TerminalEnded));
                        return;
                    }
                    Some(OpMsg::End(Some(err))) => {
                        slot.fulfill(Some(err));
                        return;
                    }
                    Some(OpMsg::End(None)) => {
                        let complete = shared.received.load(Ordering::Acquire) >= shared.recv_to
                            && shared.sent.load(Ordering::Acquire) >= shared.send_to;
                        if complete {
                            slot.fulfill(None);
                        } else {
                            slot.fulfill(Some(Error::Malformed(
                                "counter ended before reaching its targets".into(),
                            )));
                        }
                        return;
                    }
                    Some(OpMsg::Data(body)) => {
                        let mut offset = 0;
                        let n = match wire::read_varint(&body, &mut offset) {
                            Ok(n) => n,
                            Err(err) => {
                                terminal.op_end(op_id, Some(&err)).await;
                                slot.fulfill(Some(err));
                                return;
                            }
                        };
                        let expected = shared.received.load(Ordering::Acquire) + 1;
                        if n != expected {
                            let err = Error::Malformed(format!(
                                "counter out of order: got {n}, expected {expected}"
                            ));
                            terminal.op_end(op_id, Some(&err)).await;
                            slot.fulfill(Some(err));
                            return;
                        }
                        shared.received.store(n, Ordering::Release);
                        maybe_complete(&shared, &terminal, op_id, initiator, &slot).await;
                    }
                }
            }
        });
    }

    CounterHandle { result, shared }
}

async fn maybe_complete(
    shared: &CounterShared,
    terminal: &Arc<Terminal>,
    op_id: u32,
    initiator: bool,
    slot: &ResultSlot<Option<Error>>,
) {
    let complete = shared.sent.load(Ordering::Acquire) >= shared.send_to
        && shared.received.load(Ordering::Acquire) >= shared.recv_to;
    if !complete || !initiator {
        // The acceptor resolves on the initiator's clean OpEnd.
        return;
    }
    if shared.completing.swap(true, Ordering::AcqRel) {
        return;
    }
    terminal.op_end(op_id, None).await;
    slot.fulfill(None);
}
