//! Terminal sessions: operation routing, permissions and lifecycle.
//!
//! A terminal is a logical session multiplexed onto a crane. One type covers
//! the three roles a session takes in a chain:
//!
//! - **crane-attached**: owns a [`DuplexFlowQueue`] and a full operation
//!   table (the common case on both ends of a crane);
//! - **relay**: owns a flow queue but forwards every payload verbatim to an
//!   expansion operation instead of dispatching it (the middle of a chain);
//! - **tunnel**: has no flow queue of its own and rides as OpData through an
//!   upstream terminal's expansion operation (the client end of a chain).
//!
//! Parent links are weak by construction: a crane reaches its terminals
//! through its id table, and a terminal reaches the crane only through a
//! [`FrameSender`]. When a terminal ends it is dropped from the crane's
//! table via the end watch channel; there are no ownership cycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::dfq::DuplexFlowQueue;
use crate::error::{Error, Result};
use crate::link::FrameSender;
use crate::op::registry;
use crate::op::{OpAttachment, OpMsg, RemoteOpContext};
use crate::permission::Permissions;
use crate::wire::{self, InitialData, MsgKind, ReservedMsg, TerminalMsg};

/// Default flow queue size advertised for new terminals.
pub const DEFAULT_QUEUE_SIZE: u16 = 128;

/// Most operations a single terminal will track.
const OP_TABLE_MAX: usize = 4096;

/// Backlog of undispatched messages per operation.
const OP_MSG_BACKLOG: usize = 16;

const STATE_SETUP: u8 = 0;
const STATE_ESTABLISHED: u8 = 1;
const STATE_ENDING: u8 = 2;
const STATE_ENDED: u8 = 3;

/// Options for creating a terminal.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    /// Flow queue size advertised in the initial data.
    pub queue_size: u16,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Lifecycle states of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Created, initial data not yet delivered.
    Setup,
    /// Initial data delivered; operations may run.
    Established,
    /// End in progress.
    Ending,
    /// Fully ended; the terminate reason has been published.
    Ended,
}

/// The published outcome of a terminal.
#[derive(Debug, Clone)]
pub struct TerminalEnd {
    /// Human-readable reason, for logs.
    pub reason: String,
    /// The error that ended the terminal, `None` for a clean end.
    pub error: Option<Error>,
}

enum TerminalTx {
    Dfq(Arc<DuplexFlowQueue>),
    Tunnel {
        upstream: Arc<Terminal>,
        op_id: u32,
    },
}

enum DispatchSource {
    Dfq(Arc<DuplexFlowQueue>),
    Chan(mpsc::Receiver<Vec<u8>>),
}

impl DispatchSource {
    async fn next(&mut self) -> Option<Vec<u8>> {
        match self {
            DispatchSource::Dfq(dfq) => dfq.next().await,
            DispatchSource::Chan(rx) => rx.recv().await,
        }
    }
}

enum DispatchMode {
    /// Route payloads through the operation table.
    Ops,
    /// Forward payloads verbatim; capacity-1 keeps relay buffering at a
    /// single frame so back-pressure composes across hops.
    Relay(mpsc::Sender<Vec<u8>>),
}

struct OpTable {
    entries: HashMap<u32, mpsc::Sender<OpMsg>>,
    next_id: u32,
    parity_start: u32,
}

impl OpTable {
    fn new(initiator: bool) -> Self {
        // Initiators allocate odd ids, acceptors even ones, so the two ends
        // never collide. Id 0 stays reserved for flow control.
        let parity_start = if initiator { 1 } else { 2 };
        Self {
            entries: HashMap::new(),
            next_id: parity_start,
            parity_start,
        }
    }

    fn alloc(&mut self) -> Result<u32> {
        if self.entries.len() >= OP_TABLE_MAX {
            return Err(Error::OpTableFull);
        }
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.checked_add(2) {
                Some(next) => next,
                None => self.parity_start,
            };
            if id != wire::RESERVED_OP_ID && !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
    }
}

/// A logical session carrying operations over a crane (or a chain of them).
pub struct Terminal {
    id: u32,
    label: String,
    /// Back-handle to hand out owning references; weak so parents holding
    /// the strong edge decide the lifetime.
    weak_self: Weak<Terminal>,
    tx: TerminalTx,
    ops: Mutex<OpTable>,
    permissions: Mutex<Permissions>,
    granted: Mutex<Permissions>,
    state: AtomicU8,
    ending: AtomicBool,
    cancel: CancellationToken,
    end_tx: watch::Sender<Option<TerminalEnd>>,
    frames_dropped: AtomicU64,
}

impl Terminal {
    /// Create the initiating end of a crane-attached terminal.
    ///
    /// Returns the terminal plus the initial-data frame body the crane must
    /// submit on the new terminal id.
    pub fn create(
        id: u32,
        label: impl Into<String>,
        opts: &TerminalOptions,
        link: FrameSender,
        parent: &CancellationToken,
    ) -> (Arc<Self>, Vec<u8>) {
        let cancel = parent.child_token();
        let dfq = DuplexFlowQueue::new(opts.queue_size, link, cancel.clone());
        let init = InitialData {
            version: wire::WIRE_VERSION,
            queue_size: dfq.queue_size(),
            expanded: false,
        };
        let terminal = Self::build(
            id,
            label.into(),
            TerminalTx::Dfq(dfq.clone()),
            DispatchSource::Dfq(dfq),
            DispatchMode::Ops,
            true,
            cancel,
        );
        (terminal, init.encode())
    }

    /// Accept a remotely-initiated crane-attached terminal.
    pub fn accept(
        id: u32,
        label: impl Into<String>,
        init: &InitialData,
        link: FrameSender,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let dfq = DuplexFlowQueue::new(init.queue_size, link, cancel.clone());
        let terminal = Self::build(
            id,
            label.into(),
            TerminalTx::Dfq(dfq.clone()),
            DispatchSource::Dfq(dfq),
            DispatchMode::Ops,
            false,
            cancel,
        );
        terminal.mark_established();
        terminal
    }

    /// Create the relay end of an expanded terminal.
    ///
    /// Inbound payloads are forwarded verbatim into `relay_tx` instead of
    /// being dispatched; the expansion operation pumps them upstream.
    pub fn create_relay(
        id: u32,
        label: impl Into<String>,
        queue_size: u16,
        link: FrameSender,
        parent: &CancellationToken,
        relay_tx: mpsc::Sender<Vec<u8>>,
    ) -> (Arc<Self>, Vec<u8>) {
        let cancel = parent.child_token();
        let dfq = DuplexFlowQueue::new(queue_size, link, cancel.clone());
        let init = InitialData {
            version: wire::WIRE_VERSION,
            queue_size: dfq.queue_size(),
            expanded: true,
        };
        let terminal = Self::build(
            id,
            label.into(),
            TerminalTx::Dfq(dfq.clone()),
            DispatchSource::Dfq(dfq),
            DispatchMode::Relay(relay_tx),
            true,
            cancel,
        );
        terminal.mark_established();
        (terminal, init.encode())
    }

    /// Create a tunnel terminal riding through an expansion operation on
    /// `upstream`. `inbound` carries the payloads the operation receives.
    pub fn tunnel(
        upstream: Arc<Terminal>,
        op_id: u32,
        inbound: mpsc::Receiver<Vec<u8>>,
        label: impl Into<String>,
    ) -> Arc<Self> {
        let cancel = upstream.cancel.child_token();
        let terminal = Self::build(
            op_id,
            label.into(),
            TerminalTx::Tunnel { upstream, op_id },
            DispatchSource::Chan(inbound),
            DispatchMode::Ops,
            true,
            cancel,
        );
        terminal.mark_established();
        terminal
    }

    fn build(
        id: u32,
        label: String,
        tx: TerminalTx,
        source: DispatchSource,
        mode: DispatchMode,
        initiator: bool,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (end_tx, _) = watch::channel(None);
        let terminal = Arc::new_cyclic(|weak_self| Self {
            id,
            label,
            weak_self: weak_self.clone(),
            tx,
            ops: Mutex::new(OpTable::new(initiator)),
            permissions: Mutex::new(Permissions::NONE),
            granted: Mutex::new(Permissions::NONE),
            state: AtomicU8::new(STATE_SETUP),
            ending: AtomicBool::new(false),
            cancel,
            end_tx,
            frames_dropped: AtomicU64::new(0),
        });
        Self::spawn_dispatcher(terminal.clone(), source, mode);
        terminal
    }

    fn strong(&self) -> Result<Arc<Terminal>> {
        self.weak_self.upgrade().ok_or(Error::TerminalEnded)
    }

    /// Terminal id on its crane (or the tunnel op id).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Log label of this terminal.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TerminalState {
        match self.state.load(Ordering::Acquire) {
            STATE_SETUP => TerminalState::Setup,
            STATE_ESTABLISHED => TerminalState::Established,
            STATE_ENDING => TerminalState::Ending,
            _ => TerminalState::Ended,
        }
    }

    /// Whether the terminal has started or finished ending.
    pub fn is_ended(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    /// Record that the initial data has been delivered.
    pub fn mark_established(&self) {
        let _ = self.state.compare_exchange(
            STATE_SETUP,
            STATE_ESTABLISHED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// The flow queue of a crane-attached terminal.
    pub fn dfq(&self) -> Option<&Arc<DuplexFlowQueue>> {
        match &self.tx {
            TerminalTx::Dfq(dfq) => Some(dfq),
            TerminalTx::Tunnel { .. } => None,
        }
    }

    /// Permissions the peer holds on this terminal.
    pub fn permissions(&self) -> Permissions {
        *self.permissions.lock()
    }

    /// Grant the peer additional permissions on this terminal.
    pub fn grant_permission(&self, permissions: Permissions) {
        *self.permissions.lock() |= permissions;
    }

    /// Mirror of the permissions the peer has granted us.
    pub fn granted(&self) -> Permissions {
        *self.granted.lock()
    }

    /// Record permissions reported back by an authorize operation.
    pub fn note_granted(&self, permissions: Permissions) {
        *self.granted.lock() |= permissions;
    }

    /// Frames dropped because no operation claimed them.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Submit a raw frame straight to the crane, outside the flow queue.
    ///
    /// Used by the crane for the initial-data frame, which precedes the
    /// peer's flow accounting.
    pub fn submit_raw(&self, body: Vec<u8>, flush: bool) -> Result<()> {
        match &self.tx {
            TerminalTx::Dfq(dfq) => dfq.submit_direct(body, flush),
            TerminalTx::Tunnel { .. } => Err(Error::Internal(
                "tunnel terminals have no direct crane path".into(),
            )),
        }
    }

    /// Inject an inbound payload from the crane.
    ///
    /// Reserved-op frames (credits, terminal close) are consumed here so
    /// they never occupy flow queue positions.
    ///
    /// # Errors
    ///
    /// Errors are terminal-level: the caller ends this terminal, never the
    /// crane.
    pub fn deliver(&self, body: Vec<u8>) -> Result<()> {
        match wire::peek_reserved(&body)? {
            Some(ReservedMsg::Credits(credits)) => {
                match self.dfq() {
                    Some(dfq) => dfq.grant(credits),
                    None => return Err(Error::Internal("credits for tunnel terminal".into())),
                }
                Ok(())
            }
            Some(ReservedMsg::Close(err)) => {
                self.abandon("closed by peer", err);
                Ok(())
            }
            None => match self.dfq() {
                Some(dfq) => dfq.deliver_data(body),
                None => Err(Error::Internal("deliver on tunnel terminal".into())),
            },
        }
    }

    /// Feed a payload into the flow queue of a relay terminal.
    pub async fn forward(&self, body: Vec<u8>) -> Result<()> {
        match &self.tx {
            TerminalTx::Dfq(dfq) => dfq.send(body, false).await,
            TerminalTx::Tunnel { .. } => {
                Err(Error::Internal("forward on tunnel terminal".into()))
            }
        }
    }

    async fn send_payload(&self, body: Vec<u8>, flush: bool) -> Result<()> {
        if self.is_ended() {
            return Err(Error::TerminalEnded);
        }
        match &self.tx {
            TerminalTx::Dfq(dfq) => dfq.send(body, flush).await,
            TerminalTx::Tunnel { upstream, op_id } => {
                Box::pin(upstream.op_send(*op_id, body, flush)).await
            }
        }
    }

    /// Force pending frames out to the peer.
    pub async fn flush(&self) {
        match &self.tx {
            TerminalTx::Dfq(dfq) => dfq.flush().await,
            TerminalTx::Tunnel { upstream, .. } => Box::pin(upstream.flush()).await,
        }
    }

    /// Start a local operation: allocate an id, register it and emit OpStart.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OpTableFull`] when the table is exhausted and
    /// with [`Error::TerminalEnded`] once the terminal ended.
    pub async fn start_op(&self, op_type: &str, init: Vec<u8>) -> Result<OpAttachment> {
        if self.is_ended() {
            return Err(Error::TerminalEnded);
        }
        let terminal = self.strong()?;
        let (tx, rx) = mpsc::channel(OP_MSG_BACKLOG);
        let op_id = {
            let mut ops = self.ops.lock();
            let op_id = ops.alloc()?;
            ops.entries.insert(op_id, tx);
            op_id
        };
        tracing::trace!(terminal = %self.label, op_id, op_type, "starting op");
        if let Err(err) = self
            .send_payload(wire::encode_op_start(op_id, op_type, &init), true)
            .await
        {
            self.ops.lock().entries.remove(&op_id);
            return Err(err);
        }
        Ok(OpAttachment {
            terminal,
            op_id,
            msgs: rx,
        })
    }

    /// Send an OpData message for a running operation.
    pub async fn op_send(&self, op_id: u32, body: Vec<u8>, flush: bool) -> Result<()> {
        self.send_payload(wire::encode_op_data(op_id, &body), flush).await
    }

    /// End a local operation, emitting OpEnd to the peer if it was still
    /// registered. Idempotent per op id.
    pub async fn op_end(&self, op_id: u32, err: Option<&Error>) {
        let registered = self.ops.lock().entries.remove(&op_id).is_some();
        if registered && !self.is_ended() {
            if let Err(send_err) = self
                .send_payload(wire::encode_op_end(op_id, err), true)
                .await
            {
                tracing::trace!(
                    terminal = %self.label,
                    op_id,
                    error = %send_err,
                    "op end not delivered"
                );
            }
        }
    }

    /// End the terminal, notifying the peer with a close frame.
    ///
    /// Idempotent: repeated calls (from either side or from teardown) keep
    /// the first reason and do not emit duplicate close frames.
    pub fn end(&self, reason: &str, err: Option<Error>) {
        self.finish(reason, err, true);
    }

    /// End the terminal without wire traffic.
    ///
    /// For peer-initiated closes and crane teardown, where the peer either
    /// already knows or is unreachable.
    pub fn abandon(&self, reason: &str, err: Option<Error>) {
        self.finish(reason, err, false);
    }

    fn finish(&self, reason: &str, err: Option<Error>, notify_peer: bool) {
        if self.ending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(STATE_ENDING, Ordering::Release);
        tracing::debug!(
            terminal = %self.label,
            reason,
            error = err.as_ref().map(tracing::field::display),
            "terminal ending"
        );
        let record = TerminalEnd {
            reason: reason.to_string(),
            error: err,
        };

        // Wake every worker: flow queue, dispatcher, op handlers.
        self.cancel.cancel();

        // Broadcast the end to live operations locally. No wire traffic per
        // op; the single close frame below covers the peer.
        let op_err = record.error.clone().unwrap_or(Error::TerminalEnded);
        let entries: Vec<_> = {
            let mut ops = self.ops.lock();
            ops.entries.drain().collect()
        };
        for (_, tx) in entries {
            let _ = tx.try_send(OpMsg::End(Some(op_err.clone())));
        }

        if notify_peer {
            let close = wire::encode_op_end(wire::RESERVED_OP_ID, record.error.as_ref());
            match &self.tx {
                TerminalTx::Dfq(dfq) => {
                    // The send queue was discarded by cancellation; the close
                    // frame goes out directly, best effort.
                    let _ = dfq.submit_direct(close, true);
                }
                TerminalTx::Tunnel { upstream, op_id } => {
                    let upstream = upstream.clone();
                    let op_id = *op_id;
                    tokio::spawn(async move {
                        let _ = upstream.op_send(op_id, close, true).await;
                        upstream.op_end(op_id, None).await;
                    });
                }
            }
        }

        self.state.store(STATE_ENDED, Ordering::Release);
        let _ = self.end_tx.send(Some(record));
    }

    /// Watch channel carrying the published [`TerminalEnd`].
    pub fn on_end(&self) -> watch::Receiver<Option<TerminalEnd>> {
        self.end_tx.subscribe()
    }

    /// Wait until the terminal has ended and return the published outcome.
    pub async fn closed(&self) -> TerminalEnd {
        let mut rx = self.end_tx.subscribe();
        loop {
            if let Some(end) = rx.borrow_and_update().clone() {
                return end;
            }
            if rx.changed().await.is_err() {
                return TerminalEnd {
                    reason: "terminal dropped".into(),
                    error: Some(Error::TerminalEnded),
                };
            }
        }
    }

    fn spawn_dispatcher(terminal: Arc<Terminal>, source: DispatchSource, mode: DispatchMode) {
        tokio::spawn(async move {
            let mut source = source;
            loop {
                let body = tokio::select! {
                    _ = terminal.cancel.cancelled() => break,
                    body = source.next() => match body {
                        Some(body) => body,
                        None => {
                            terminal.abandon("inbound closed", Some(Error::TerminalEnded));
                            break;
                        }
                    },
                };
                match &mode {
                    DispatchMode::Relay(up) => {
                        let forwarded = tokio::select! {
                            _ = terminal.cancel.cancelled() => false,
                            res = up.send(body) => res.is_ok(),
                        };
                        if !forwarded {
                            terminal.end("relay detached", Some(Error::TerminalEnded));
                            break;
                        }
                    }
                    DispatchMode::Ops => {
                        if let Err(err) = terminal.dispatch(body).await {
                            terminal.end("dispatch failed", Some(err));
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn dispatch(&self, body: Vec<u8>) -> Result<()> {
        let msg = TerminalMsg::parse(&body)?;
        if msg.op_id == wire::RESERVED_OP_ID {
            return match msg.kind {
                MsgKind::End => {
                    let err = wire::parse_op_end(&msg.body)?;
                    self.abandon("closed by peer", err);
                    Ok(())
                }
                _ => Err(Error::Malformed("unexpected frame on reserved op id".into())),
            };
        }
        match msg.kind {
            MsgKind::Start => self.handle_op_start(msg.op_id, &msg.body).await,
            MsgKind::Data => {
                let entry = self.ops.lock().entries.get(&msg.op_id).cloned();
                match entry {
                    Some(tx) => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {}
                            _ = tx.send(OpMsg::Data(msg.body)) => {}
                        }
                    }
                    None => {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            terminal = %self.label,
                            op_id = msg.op_id,
                            "dropping data for unknown op"
                        );
                    }
                }
                Ok(())
            }
            MsgKind::End => {
                let entry = self.ops.lock().entries.remove(&msg.op_id);
                if let Some(tx) = entry {
                    let err = wire::parse_op_end(&msg.body)?;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tx.send(OpMsg::End(err)) => {}
                    }
                }
                Ok(())
            }
        }
    }

    async fn handle_op_start(&self, op_id: u32, body: &[u8]) -> Result<()> {
        let (name, init) = wire::parse_op_start(body)?;
        let Some(spec) = registry::active().lookup(&name) else {
            tracing::debug!(terminal = %self.label, op_type = %name, "unknown op type");
            return self.reject_op(op_id, &Error::UnknownOpType(name)).await;
        };
        if !self.permissions().has(spec.requires) {
            tracing::debug!(terminal = %self.label, op_type = %name, "op start denied");
            return self.reject_op(op_id, &Error::PermissionDenied).await;
        }

        let (tx, rx) = mpsc::channel(OP_MSG_BACKLOG);
        enum StartSlot {
            Inserted,
            Full,
            Duplicate,
        }
        let slot = {
            let mut ops = self.ops.lock();
            if ops.entries.len() >= OP_TABLE_MAX {
                StartSlot::Full
            } else if ops.entries.contains_key(&op_id) {
                StartSlot::Duplicate
            } else {
                ops.entries.insert(op_id, tx);
                StartSlot::Inserted
            }
        };
        match slot {
            StartSlot::Full => return self.reject_op(op_id, &Error::OpTableFull).await,
            StartSlot::Duplicate => {
                return Err(Error::Malformed(format!("op id {op_id} reused")))
            }
            StartSlot::Inserted => {}
        }
        let ctx = RemoteOpContext {
            terminal: self.strong()?,
            op_id,
            init,
            msgs: rx,
        };
        if let Err(err) = (spec.start)(ctx) {
            self.ops.lock().entries.remove(&op_id);
            return self.reject_op(op_id, &err).await;
        }
        Ok(())
    }

    async fn reject_op(&self, op_id: u32, err: &Error) -> Result<()> {
        self.send_payload(wire::encode_op_end(op_id, Some(err)), true)
            .await
    }
}
