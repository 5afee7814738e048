//! The ship contract: an ordered, bidirectional transport of opaque blobs.
//!
//! Physical ships (TCP, KCP, …) live outside the data plane; the crane only
//! needs the contract below. [`TestShip`] provides connected in-process
//! pairs with a configurable one-way delay for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// An ordered bidirectional blob transport between two hubs.
///
/// Blobs are delivered whole and in order; a blob never exceeds
/// [`Ship::max_payload`]. Exactly one crane owns a ship for its lifetime.
#[async_trait]
pub trait Ship: Send + Sync {
    /// Send one blob to the peer.
    async fn write(&self, blob: Vec<u8>) -> Result<()>;

    /// Receive the next blob from the peer.
    async fn read(&self) -> Result<Vec<u8>>;

    /// Largest blob this ship can carry.
    fn max_payload(&self) -> usize;

    /// Whether this end dialed the connection (the crane controller side).
    fn is_initiator(&self) -> bool;

    /// Close the ship; both ends' pending reads fail.
    async fn close(&self);
}

type Lane = mpsc::UnboundedSender<(Instant, Vec<u8>)>;

/// An in-process ship for tests, created in connected pairs.
pub struct TestShip {
    initiator: bool,
    delay: Duration,
    max_payload: usize,
    tx: Mutex<Option<Lane>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Instant, Vec<u8>)>>,
    closed: CancellationToken,
}

impl TestShip {
    /// Create a connected pair with a one-way `delay` per blob.
    ///
    /// The first ship of the pair is the initiator.
    pub fn pair(delay: Duration, max_payload: usize) -> (Arc<TestShip>, Arc<TestShip>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let initiator = Arc::new(TestShip {
            initiator: true,
            delay,
            max_payload,
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
            closed: closed.clone(),
        });
        let acceptor = Arc::new(TestShip {
            initiator: false,
            delay,
            max_payload,
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
            closed,
        });
        (initiator, acceptor)
    }
}

#[async_trait]
impl Ship for TestShip {
    async fn write(&self, blob: Vec<u8>) -> Result<()> {
        if blob.len() > self.max_payload {
            return Err(Error::Ship(format!(
                "blob of {} bytes exceeds max payload {}",
                blob.len(),
                self.max_payload
            )));
        }
        if self.closed.is_cancelled() {
            return Err(Error::Ship("ship closed".into()));
        }
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send((Instant::now() + self.delay, blob))
                .map_err(|_| Error::Ship("ship closed".into())),
            None => Err(Error::Ship("ship closed".into())),
        }
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        let received = tokio::select! {
            _ = self.closed.cancelled() => None,
            blob = rx.recv() => blob,
        };
        match received {
            Some((at, blob)) => {
                tokio::time::sleep_until(at).await;
                Ok(blob)
            }
            None => Err(Error::Ship("ship closed".into())),
        }
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    async fn close(&self) {
        self.tx.lock().take();
        self.closed.cancel();
    }
}
