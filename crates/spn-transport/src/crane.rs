//! The crane: per-ship multiplexer, link handshake and encryption.
//!
//! One crane owns one ship. After the handshake it runs two workers: a
//! reader that opens inbound blobs and dispatches frames to terminals, and
//! a writer that coalesces outbound frames into loads. Frames are batched
//! up to `optimal_min_load` bytes unless a submission asks for a flush or
//! the hold-down timer elapses; loads never split a frame and respect the
//! ship's maximum payload.
//!
//! Control traffic rides on the reserved terminal id 0:
//!
//! ```text
//! u8(type) | payload
//!   1 HandshakeInit  u8(version) | u8(flags) [| kex init]
//!   2 HandshakeAck   u8(version) | u8(flags) [| kex ack]
//!   3 Close          varint(error_code) | varint(msg_len) | msg
//!   4 Ping           u8(seq)
//!   5 Pong           u8(seq)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use spn_core::error::Error as CoreError;
use spn_core::link::{FrameSender, OutFrame};
use spn_core::terminal::{Terminal, TerminalOptions, DEFAULT_QUEUE_SIZE};
use spn_core::wire;
use spn_crypto::aead::TAG_LEN;
use spn_crypto::{Identity, LinkCipher, LinkKeyExchange};

use crate::error::{Error, Result};
use crate::registry;
use crate::ship::Ship;

const PROTOCOL_VERSION: u8 = 1;

const CTRL_HANDSHAKE_INIT: u8 = 1;
const CTRL_HANDSHAKE_ACK: u8 = 2;
const CTRL_CLOSE: u8 = 3;
const CTRL_PING: u8 = 4;
const CTRL_PONG: u8 = 5;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// Handshakes are allowed seconds, not milliseconds; links may be slow.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer waits for more frames before flushing a small load.
const DEFAULT_HOLD_DOWN: Duration = Duration::from_millis(5);

/// Soft lower bound under which the writer keeps coalescing.
const DEFAULT_OPTIMAL_MIN_LOAD: usize = 1024;

/// Stable identifier of a hub in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubId(String);

impl HubId {
    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HubId {
    fn from(value: &str) -> Self {
        HubId(value.to_string())
    }
}

impl From<String> for HubId {
    fn from(value: String) -> Self {
        HubId(value)
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the hub catalog knows about a peer hub.
#[derive(Clone)]
pub struct RemoteHub {
    /// The peer's stable id.
    pub id: HubId,
    /// The peer's identity key, used to verify the handshake.
    pub key: ed25519_dalek::VerifyingKey,
}

/// Lifecycle states of a crane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CraneState {
    /// Created or handshaking; no terminal traffic yet.
    Handshaking,
    /// Handshake complete, workers running.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Fully stopped; no further frames are emitted.
    Stopped,
}

/// Options for creating a crane.
#[derive(Clone)]
pub struct CraneOptions {
    /// Stable id within this process, used in logs and the registry.
    pub id: String,
    /// Peer identity from the hub catalog. Required on the controller side
    /// of an encrypted crane; its presence turns encryption on.
    pub remote_hub: Option<RemoteHub>,
    /// Local identity. Required to accept encrypted cranes.
    pub identity: Option<Arc<Identity>>,
    /// Flow queue size for terminals this crane creates.
    pub queue_size: u16,
    /// Soft lower bound for outbound load coalescing.
    pub optimal_min_load: usize,
    /// Writer hold-down before flushing a small load.
    pub hold_down: Duration,
}

impl Default for CraneOptions {
    fn default() -> Self {
        Self {
            id: "crane".to_string(),
            remote_hub: None,
            identity: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            optimal_min_load: DEFAULT_OPTIMAL_MIN_LOAD,
            hold_down: DEFAULT_HOLD_DOWN,
        }
    }
}

/// Per-ship multiplexer carrying many terminals.
pub struct Crane {
    id: String,
    weak_self: Weak<Crane>,
    controller: bool,
    public: AtomicBool,
    ship: Arc<dyn Ship>,
    remote_hub: Option<RemoteHub>,
    identity: Option<Arc<Identity>>,
    queue_size: u16,
    optimal_min_load: usize,
    hold_down: Duration,
    state: Mutex<CraneState>,
    terminals: Mutex<HashMap<u32, Arc<Terminal>>>,
    next_terminal_id: AtomicU32,
    out_tx: mpsc::UnboundedSender<OutFrame>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<OutFrame>>>,
    cipher: Mutex<Option<LinkCipher>>,
    cancel: CancellationToken,
    close_frame: OnceLock<Option<Vec<u8>>>,
    last_seen: Mutex<Instant>,
    ping_seq: AtomicU64,
    unknown_frames: AtomicU64,
    assigned_hubs: Mutex<Vec<HubId>>,
}

impl Crane {
    /// Create a crane over a ship. The ship initiator side is the crane
    /// controller; terminal ids follow the same parity rule as op ids.
    pub fn new(ship: Arc<dyn Ship>, opts: CraneOptions) -> Arc<Crane> {
        let controller = ship.is_initiator();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak_self| Crane {
            id: opts.id,
            weak_self: weak_self.clone(),
            controller,
            public: AtomicBool::new(false),
            ship,
            remote_hub: opts.remote_hub,
            identity: opts.identity,
            queue_size: opts.queue_size,
            optimal_min_load: opts.optimal_min_load,
            hold_down: opts.hold_down,
            state: Mutex::new(CraneState::Handshaking),
            terminals: Mutex::new(HashMap::new()),
            next_terminal_id: AtomicU32::new(if controller { 1 } else { 2 }),
            out_tx,
            writer_rx: Mutex::new(Some(out_rx)),
            cipher: Mutex::new(None),
            cancel: CancellationToken::new(),
            close_frame: OnceLock::new(),
            last_seen: Mutex::new(Instant::now()),
            ping_seq: AtomicU64::new(0),
            unknown_frames: AtomicU64::new(0),
            assigned_hubs: Mutex::new(Vec::new()),
        })
    }

    /// Crane id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this end initiated the crane.
    pub fn is_controller(&self) -> bool {
        self.controller
    }

    /// Whether the crane may carry third-party terminals.
    pub fn is_public(&self) -> bool {
        self.public.load(Ordering::Relaxed)
    }

    /// Mark the crane as carrying third-party terminals.
    pub fn mark_public(&self) {
        self.public.store(true, Ordering::Relaxed);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CraneState {
        *self.state.lock()
    }

    /// Number of live terminals.
    pub fn terminal_count(&self) -> usize {
        self.terminals.lock().len()
    }

    /// Frames dropped because no terminal claimed them.
    pub fn unknown_frames(&self) -> u64 {
        self.unknown_frames.load(Ordering::Relaxed)
    }

    /// Time since the last blob arrived; the health-check hook.
    pub fn idle_time(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Send a keepalive ping. The peer answers with a pong, which refreshes
    /// [`Crane::idle_time`] on both ends. Cadence is the caller's policy.
    pub fn ping(&self) {
        let seq = (self.ping_seq.fetch_add(1, Ordering::Relaxed) & 0xFF) as u8;
        let _ = self.out_tx.send(OutFrame {
            terminal_id: 0,
            body: vec![CTRL_PING, seq],
            flush: true,
        });
    }

    /// Run the handshake and start the reader and writer workers.
    ///
    /// # Errors
    ///
    /// A handshake failure or timeout moves the crane straight to
    /// [`CraneState::Stopped`].
    pub async fn start(&self) -> Result<()> {
        if self.state() != CraneState::Handshaking {
            return Err(Error::Handshake("crane already started".into()));
        }
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::Handshake("crane dropped".into()))?;
        let cipher = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake()).await {
            Ok(Ok(cipher)) => cipher,
            Ok(Err(err)) => {
                self.tear(None, "handshake failed", false);
                return Err(err);
            }
            Err(_) => {
                self.tear(None, "handshake timed out", false);
                return Err(Error::Handshake("timed out".into()));
            }
        };
        let encrypted = cipher.is_some();
        *self.cipher.lock() = cipher;
        *self.state.lock() = CraneState::Running;

        let writer_rx = self
            .writer_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Handshake("crane already started".into()))?;
        tokio::spawn(Self::run_reader(this.clone()));
        tokio::spawn(Self::run_writer(this.clone(), writer_rx));

        if let Some(hub) = &self.remote_hub {
            registry::assign_crane(hub.id.clone(), this);
        }
        tracing::debug!(crane = %self.id, controller = self.controller, encrypted, "crane running");
        Ok(())
    }

    async fn handshake(&self) -> Result<Option<LinkCipher>> {
        if self.controller {
            let encrypted = self.remote_hub.is_some();
            let mut init = vec![
                CTRL_HANDSHAKE_INIT,
                PROTOCOL_VERSION,
                if encrypted { FLAG_ENCRYPTED } else { 0 },
            ];
            let kx = if encrypted {
                let (kx, msg) = LinkKeyExchange::initiate();
                init.extend_from_slice(&msg);
                Some(kx)
            } else {
                None
            };
            self.write_control(&init).await?;

            let ack = self.read_control().await?;
            if ack.len() < 3 || ack[0] != CTRL_HANDSHAKE_ACK {
                return Err(Error::Handshake("unexpected responder message".into()));
            }
            if ack[1] != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!("peer speaks version {}", ack[1])));
            }
            if (ack[2] & FLAG_ENCRYPTED != 0) != encrypted {
                return Err(Error::Handshake("encryption flag mismatch".into()));
            }
            match kx {
                Some(kx) => {
                    let hub = self
                        .remote_hub
                        .as_ref()
                        .ok_or_else(|| Error::Handshake("missing remote hub".into()))?;
                    let secret = kx.finalize(&ack[3..], &hub.key)?;
                    Ok(Some(LinkCipher::new(&secret, true)))
                }
                None => Ok(None),
            }
        } else {
            let init = self.read_control().await?;
            if init.len() < 3 || init[0] != CTRL_HANDSHAKE_INIT {
                return Err(Error::Handshake("unexpected controller message".into()));
            }
            if init[1] != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!("peer speaks version {}", init[1])));
            }
            if init[2] & FLAG_ENCRYPTED != 0 {
                let identity = self.identity.as_ref().ok_or_else(|| {
                    Error::Handshake("peer requires encryption, no identity configured".into())
                })?;
                let (ack_kx, secret) = spn_crypto::kex::respond(identity, &init[3..])?;
                let mut ack = vec![CTRL_HANDSHAKE_ACK, PROTOCOL_VERSION, FLAG_ENCRYPTED];
                ack.extend_from_slice(&ack_kx);
                self.write_control(&ack).await?;
                Ok(Some(LinkCipher::new(&secret, false)))
            } else {
                self.write_control(&[CTRL_HANDSHAKE_ACK, PROTOCOL_VERSION, 0])
                    .await?;
                Ok(None)
            }
        }
    }

    async fn write_control(&self, body: &[u8]) -> Result<()> {
        let mut blob = Vec::with_capacity(body.len() + 4);
        wire::encode_crane_frame(&mut blob, 0, body);
        self.ship.write(blob).await
    }

    async fn read_control(&self) -> Result<Vec<u8>> {
        loop {
            let blob = self.ship.read().await?;
            let mut offset = 0;
            while offset < blob.len() {
                let (terminal_id, body) = wire::parse_crane_frame(&blob, &mut offset)
                    .map_err(|err| Error::Handshake(err.to_string()))?;
                if body.is_empty() {
                    continue;
                }
                if terminal_id != 0 {
                    return Err(Error::Handshake("terminal frame during handshake".into()));
                }
                return Ok(body.to_vec());
            }
        }
    }

    /// Create a terminal on this crane and announce it to the peer.
    pub fn establish_terminal(
        &self,
        opts: &TerminalOptions,
    ) -> std::result::Result<Arc<Terminal>, CoreError> {
        self.ensure_running()?;
        let terminal_id = self.alloc_terminal_id();
        let link = FrameSender::new(terminal_id, self.out_tx.clone());
        let (terminal, init) = Terminal::create(
            terminal_id,
            format!("{}#{}", self.id, terminal_id),
            opts,
            link,
            &self.cancel,
        );
        self.announce(terminal_id, terminal, init)
    }

    /// Create a relay terminal for an expansion; inbound payloads go to
    /// `relay_tx` verbatim instead of an op table.
    pub(crate) fn establish_relay_terminal(
        &self,
        relay_tx: mpsc::Sender<Vec<u8>>,
    ) -> std::result::Result<Arc<Terminal>, CoreError> {
        self.ensure_running()?;
        let terminal_id = self.alloc_terminal_id();
        let link = FrameSender::new(terminal_id, self.out_tx.clone());
        let (terminal, init) = Terminal::create_relay(
            terminal_id,
            format!("{}#{}r", self.id, terminal_id),
            self.queue_size,
            link,
            &self.cancel,
            relay_tx,
        );
        self.announce(terminal_id, terminal, init)
    }

    fn announce(
        &self,
        terminal_id: u32,
        terminal: Arc<Terminal>,
        init: Vec<u8>,
    ) -> std::result::Result<Arc<Terminal>, CoreError> {
        terminal.submit_raw(init, true)?;
        terminal.mark_established();
        self.terminals.lock().insert(terminal_id, terminal.clone());
        self.watch_terminal(terminal_id, terminal.clone());
        tracing::debug!(crane = %self.id, terminal = terminal_id, "terminal established");
        Ok(terminal)
    }

    fn alloc_terminal_id(&self) -> u32 {
        self.next_terminal_id.fetch_add(2, Ordering::SeqCst)
    }

    fn ensure_running(&self) -> std::result::Result<(), CoreError> {
        if self.state() != CraneState::Running {
            return Err(CoreError::CraneTorn);
        }
        Ok(())
    }

    fn watch_terminal(&self, terminal_id: u32, terminal: Arc<Terminal>) {
        let crane = self.weak_self.clone();
        tokio::spawn(async move {
            terminal.closed().await;
            if let Some(crane) = crane.upgrade() {
                crane.terminals.lock().remove(&terminal_id);
            }
        });
    }

    /// Stop the crane gracefully, telling the peer why.
    pub fn stop(&self, reason: &str) {
        self.tear(None, reason, true);
    }

    fn tear(&self, err: Option<CoreError>, reason: &str, send_close: bool) {
        {
            let mut state = self.state.lock();
            if matches!(*state, CraneState::Stopping | CraneState::Stopped) {
                return;
            }
            *state = CraneState::Stopping;
        }
        tracing::info!(
            crane = %self.id,
            reason,
            error = err.as_ref().map(tracing::field::display),
            "crane stopping"
        );

        // The writer emits the close frame on its way out; the outbound
        // queue itself is discarded.
        let close = send_close.then(|| {
            let mut ctrl = vec![CTRL_CLOSE];
            ctrl.extend_from_slice(&wire::encode_error(err.as_ref()));
            let mut framed = Vec::with_capacity(ctrl.len() + 4);
            wire::encode_crane_frame(&mut framed, 0, &ctrl);
            framed
        });
        let _ = self.close_frame.set(close);

        self.cancel.cancel();

        let torn = err.unwrap_or(CoreError::CraneTorn);
        let terminals: Vec<_> = self.terminals.lock().drain().map(|(_, t)| t).collect();
        for terminal in terminals {
            terminal.abandon(reason, Some(torn.clone()));
        }

        let hubs = self.assigned_hubs.lock().clone();
        registry::retract(&self.id, &hubs);

        // If the writer never started there is nobody to release the ship.
        if self.writer_rx.lock().is_some() {
            let ship = self.ship.clone();
            tokio::spawn(async move { ship.close().await });
        }
        *self.state.lock() = CraneState::Stopped;
    }

    pub(crate) fn note_assignment(&self, hub: HubId) {
        self.assigned_hubs.lock().push(hub);
    }

    fn open_blob(&self, blob: Vec<u8>) -> std::result::Result<Vec<u8>, spn_crypto::Error> {
        let mut cipher = self.cipher.lock();
        match cipher.as_mut() {
            Some(cipher) => cipher.open(&blob),
            None => Ok(blob),
        }
    }

    fn seal_load(&self, load: Vec<u8>) -> std::result::Result<Vec<u8>, spn_crypto::Error> {
        let mut cipher = self.cipher.lock();
        match cipher.as_mut() {
            Some(cipher) => cipher.seal(&load),
            None => Ok(load),
        }
    }

    async fn run_reader(crane: Arc<Crane>) {
        loop {
            let blob = tokio::select! {
                _ = crane.cancel.cancelled() => return,
                blob = crane.ship.read() => match blob {
                    Ok(blob) => blob,
                    Err(err) => {
                        tracing::debug!(crane = %crane.id, error = %err, "ship read failed");
                        crane.tear(Some(CoreError::CraneTorn), "ship read failed", false);
                        return;
                    }
                },
            };
            *crane.last_seen.lock() = Instant::now();
            let data = match crane.open_blob(blob) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(crane = %crane.id, error = %err, "inbound record rejected");
                    crane.tear(Some(CoreError::CraneTorn), "link record rejected", false);
                    return;
                }
            };

            let mut offset = 0;
            while offset < data.len() {
                let (terminal_id, body) = match wire::parse_crane_frame(&data, &mut offset) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(crane = %crane.id, error = %err, "malformed crane frame");
                        crane.tear(Some(CoreError::CraneTorn), "malformed crane frame", true);
                        return;
                    }
                };
                if body.is_empty() {
                    // padding
                    continue;
                }
                if terminal_id == 0 {
                    if !crane.handle_control(body) {
                        return;
                    }
                    continue;
                }
                let terminal = crane.terminals.lock().get(&terminal_id).cloned();
                match terminal {
                    Some(terminal) => {
                        if let Err(err) = terminal.deliver(body.to_vec()) {
                            // terminal-level failure; the crane stays up
                            tracing::warn!(
                                crane = %crane.id,
                                terminal = terminal_id,
                                error = %err,
                                "delivery failed"
                            );
                            terminal.end("delivery failed", Some(err));
                        }
                    }
                    None => crane.try_accept(terminal_id, body),
                }
            }
        }
    }

    /// Handle a control frame; returns false when the reader must exit.
    fn handle_control(&self, body: &[u8]) -> bool {
        match body[0] {
            CTRL_CLOSE => {
                let err = wire::parse_op_end(&body[1..]).ok().flatten();
                self.tear(err, "closed by peer", false);
                false
            }
            CTRL_PING => {
                if body.len() >= 2 {
                    let _ = self.out_tx.send(OutFrame {
                        terminal_id: 0,
                        body: vec![CTRL_PONG, body[1]],
                        flush: true,
                    });
                }
                true
            }
            CTRL_PONG => true,
            other => {
                tracing::warn!(crane = %self.id, control = other, "unexpected control message");
                self.tear(
                    Some(CoreError::Malformed(format!("control message {other}"))),
                    "protocol violation",
                    true,
                );
                false
            }
        }
    }

    fn try_accept(&self, terminal_id: u32, body: &[u8]) {
        let init = match wire::InitialData::parse(body) {
            Ok(init) => init,
            Err(_) => {
                self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(crane = %self.id, terminal = terminal_id, "dropping unknown frame");
                return;
            }
        };
        // The peer allocates ids of the opposite parity; anything else is a
        // stray frame, not a new session.
        let peer_allocates_odd = !self.controller;
        if (terminal_id % 2 == 1) != peer_allocates_odd {
            self.unknown_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let link = FrameSender::new(terminal_id, self.out_tx.clone());
        let terminal = Terminal::accept(
            terminal_id,
            format!("{}#{}", self.id, terminal_id),
            &init,
            link,
            &self.cancel,
        );
        tracing::debug!(
            crane = %self.id,
            terminal = terminal_id,
            expanded = init.expanded,
            "accepted terminal"
        );
        self.terminals.lock().insert(terminal_id, terminal.clone());
        self.watch_terminal(terminal_id, terminal);
    }

    async fn run_writer(crane: Arc<Crane>, mut rx: mpsc::UnboundedReceiver<OutFrame>) {
        let overhead = if crane.cipher.lock().is_some() { TAG_LEN } else { 0 };
        let usable = crane.ship.max_payload().saturating_sub(overhead).max(16);

        'outer: loop {
            let first = tokio::select! {
                _ = crane.cancel.cancelled() => break 'outer,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break 'outer,
                },
            };
            let mut batch = LoadBatch::new(usable, &crane.id);
            let mut flush = first.flush;
            batch.push(first);

            while !flush && batch.total() < crane.optimal_min_load {
                match rx.try_recv() {
                    Ok(frame) => {
                        flush |= frame.flush;
                        batch.push(frame);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {
                        let waited = tokio::select! {
                            _ = crane.cancel.cancelled() => break 'outer,
                            frame = tokio::time::timeout(crane.hold_down, rx.recv()) => frame,
                        };
                        match waited {
                            Ok(Some(frame)) => {
                                flush |= frame.flush;
                                batch.push(frame);
                            }
                            // channel closed or hold-down elapsed
                            Ok(None) | Err(_) => break,
                        }
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            for load in batch.into_loads() {
                let blob = match crane.seal_load(load) {
                    Ok(blob) => blob,
                    Err(err) => {
                        tracing::warn!(crane = %crane.id, error = %err, "sealing failed");
                        crane.tear(Some(CoreError::CraneTorn), "sealing failed", false);
                        break 'outer;
                    }
                };
                if let Err(err) = crane.ship.write(blob).await {
                    tracing::debug!(crane = %crane.id, error = %err, "ship write failed");
                    crane.tear(Some(CoreError::CraneTorn), "ship write failed", false);
                    break 'outer;
                }
            }
        }

        // Best effort close frame on the way out, then release the ship.
        if let Some(Some(frame)) = crane.close_frame.get() {
            if let Ok(blob) = crane.seal_load(frame.clone()) {
                let _ = tokio::time::timeout(Duration::from_secs(1), crane.ship.write(blob)).await;
            }
        }
        crane.ship.close().await;
    }
}

/// Outbound frames packed into ship loads, split at frame boundaries.
struct LoadBatch<'a> {
    usable: usize,
    loads: Vec<Vec<u8>>,
    total: usize,
    crane_id: &'a str,
}

impl<'a> LoadBatch<'a> {
    fn new(usable: usize, crane_id: &'a str) -> Self {
        Self {
            usable,
            loads: Vec::new(),
            total: 0,
            crane_id,
        }
    }

    fn push(&mut self, frame: OutFrame) {
        if frame.body.is_empty() {
            // pure flush marker
            return;
        }
        let mut encoded = Vec::with_capacity(frame.body.len() + 8);
        wire::encode_crane_frame(&mut encoded, frame.terminal_id, &frame.body);
        if encoded.len() > self.usable {
            tracing::warn!(
                crane = %self.crane_id,
                terminal = frame.terminal_id,
                size = encoded.len(),
                "frame exceeds ship payload, dropping"
            );
            return;
        }
        let len = encoded.len();
        match self.loads.last_mut() {
            Some(load) if load.len() + len <= self.usable => load.extend_from_slice(&encoded),
            _ => self.loads.push(encoded),
        }
        self.total += len;
    }

    fn total(&self) -> usize {
        self.total
    }

    fn into_loads(self) -> Vec<Vec<u8>> {
        self.loads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(terminal_id: u32, len: usize) -> OutFrame {
        OutFrame {
            terminal_id,
            body: vec![0xAB; len],
            flush: false,
        }
    }

    #[test]
    fn test_load_batch_splits_at_frame_boundaries() {
        let mut batch = LoadBatch::new(32, "test");
        batch.push(frame(1, 10)); // 12 bytes encoded
        batch.push(frame(1, 10)); // fits: 24
        batch.push(frame(1, 10)); // would be 36, new load
        let loads = batch.into_loads();
        assert_eq!(loads.len(), 2);
        assert!(loads.iter().all(|load| load.len() <= 32));
    }

    #[test]
    fn test_load_batch_drops_oversized_frames() {
        let mut batch = LoadBatch::new(16, "test");
        batch.push(frame(1, 64));
        assert_eq!(batch.total(), 0);
        assert!(batch.into_loads().is_empty());
    }

    #[test]
    fn test_load_batch_skips_flush_markers() {
        let mut batch = LoadBatch::new(32, "test");
        batch.push(OutFrame {
            terminal_id: 3,
            body: Vec::new(),
            flush: true,
        });
        assert!(batch.into_loads().is_empty());
    }
}
