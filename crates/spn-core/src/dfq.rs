//! Duplex Flow Queue: credit-based back-pressure inside a terminal.
//!
//! Each direction advertises a queue size; the sender starts with that many
//! credits, spends one per data frame, and receives them back only after the
//! receiver has taken the frame out of its queue. The books therefore always
//! balance: `credits held + frames in flight + frames queued == queue_size`.
//!
//! Credit grants travel as reserved-op frames and are submitted straight to
//! the crane, so they never occupy queue positions and are never stuck
//! behind data back-pressure. Grants are batched: one is emitted once half
//! the queue size is pending, or as soon as the receive queue drains while
//! anything is pending, which makes conservation eventually exact.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::link::FrameSender;
use crate::wire;

enum SendItem {
    Frame { body: Vec<u8>, flush: bool },
    Flush,
}

/// Credit-based reliable in-order stream inside a terminal.
pub struct DuplexFlowQueue {
    queue_size: u16,
    link: FrameSender,
    send_tx: mpsc::Sender<SendItem>,
    /// Credits the peer has granted us. A watch channel doubles as the
    /// "ready to send" condition for the send worker.
    send_space: watch::Sender<i32>,
    recv_tx: mpsc::Sender<Vec<u8>>,
    recv_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Frames currently sitting in the receive queue.
    recv_len: AtomicI32,
    /// Credits freed locally but not yet granted to the peer.
    pending_grant: AtomicU32,
    cancel: CancellationToken,
}

impl DuplexFlowQueue {
    /// Create a queue and spawn its send worker.
    ///
    /// `queue_size` is the size both directions agreed on in the terminal's
    /// initial data; the peer starts with the same number of credits we do.
    pub fn new(queue_size: u16, link: FrameSender, cancel: CancellationToken) -> Arc<Self> {
        let queue_size = queue_size.max(1);
        let (send_tx, send_rx) = mpsc::channel(usize::from(queue_size));
        let (recv_tx, recv_rx) = mpsc::channel(usize::from(queue_size));
        let (send_space, _) = watch::channel(i32::from(queue_size));

        let dfq = Arc::new(Self {
            queue_size,
            link,
            send_tx,
            send_space,
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            recv_len: AtomicI32::new(0),
            pending_grant: AtomicU32::new(0),
            cancel,
        });
        tokio::spawn(Self::send_worker(dfq.clone(), send_rx));
        dfq
    }

    /// Queue a frame for sending, blocking while the send queue is full.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TerminalEnded`] once the owning terminal ended.
    pub async fn send(&self, body: Vec<u8>, flush: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TerminalEnded);
        }
        tokio::select! {
            res = self.send_tx.send(SendItem::Frame { body, flush }) => {
                res.map_err(|_| Error::TerminalEnded)
            }
            _ = self.cancel.cancelled() => Err(Error::TerminalEnded),
        }
    }

    /// Ask the send worker to flush whatever it has to the crane.
    pub async fn flush(&self) {
        tokio::select! {
            _ = self.send_tx.send(SendItem::Flush) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Submit a frame to the crane directly, bypassing queue and credits.
    ///
    /// Reserved for traffic outside the data stream: credit grants and the
    /// terminal close frame.
    pub fn submit_direct(&self, body: Vec<u8>, flush: bool) -> Result<()> {
        self.link.submit(body, flush)
    }

    /// Add credits granted by the peer and wake the send worker.
    pub fn grant(&self, credits: u32) {
        self.send_space.send_modify(|space| *space += credits as i32);
    }

    /// Queue an inbound data frame. Called from the crane's deliver path.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Malformed`] when the peer overran its credits and
    /// with [`Error::TerminalEnded`] when the terminal is gone.
    pub fn deliver_data(&self, body: Vec<u8>) -> Result<()> {
        match self.recv_tx.try_send(body) {
            Ok(()) => {
                self.recv_len.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(Error::Malformed("flow window exceeded".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::TerminalEnded),
        }
    }

    /// Take the next inbound frame, returning credits to the peer as slots
    /// free up. Returns `None` once the terminal ended.
    pub async fn next(&self) -> Option<Vec<u8>> {
        let body = {
            let mut rx = self.recv_rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                body = rx.recv() => body?,
            }
        };
        let remaining = self.recv_len.fetch_sub(1, Ordering::AcqRel) - 1;
        let pending = self.pending_grant.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.grant_threshold() || remaining == 0 {
            let grant = self.pending_grant.swap(0, Ordering::AcqRel);
            if grant > 0 {
                // Best effort: if the crane is gone the terminal is ending.
                let _ = self.submit_direct(wire::encode_credits(grant), true);
            }
        }
        Some(body)
    }

    fn grant_threshold(&self) -> u32 {
        u32::from(self.queue_size / 2).max(1)
    }

    /// Credits currently available for sending.
    pub fn send_space(&self) -> i32 {
        *self.send_space.borrow()
    }

    /// Frames waiting in the receive queue.
    pub fn queued(&self) -> usize {
        self.recv_len.load(Ordering::Acquire).max(0) as usize
    }

    /// Queue size both directions agreed on.
    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    async fn send_worker(dfq: Arc<Self>, mut rx: mpsc::Receiver<SendItem>) {
        let mut space = dfq.send_space.subscribe();
        loop {
            let item = tokio::select! {
                _ = dfq.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item {
                SendItem::Flush => {
                    if dfq.link.submit(Vec::new(), true).is_err() {
                        break;
                    }
                }
                SendItem::Frame { body, flush } => {
                    let granted = tokio::select! {
                        _ = dfq.cancel.cancelled() => false,
                        res = space.wait_for(|credits| *credits > 0) => res.is_ok(),
                    };
                    if !granted {
                        break;
                    }
                    dfq.send_space.send_modify(|space| *space -= 1);
                    if dfq.link.submit(body, flush).is_err() {
                        break;
                    }
                }
            }
        }
        // Remaining queued frames are dropped; the terminal has ended.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn queue(queue_size: u16) -> (Arc<DuplexFlowQueue>, mpsc::UnboundedReceiver<crate::OutFrame>) {
        let (tx, rx) = unbounded_channel();
        let dfq = DuplexFlowQueue::new(queue_size, FrameSender::new(1, tx), CancellationToken::new());
        (dfq, rx)
    }

    #[tokio::test]
    async fn test_send_consumes_credits() {
        let (dfq, mut out) = queue(2);
        assert_eq!(dfq.send_space(), 2);

        dfq.send(b"a".to_vec(), false).await.unwrap();
        dfq.send(b"b".to_vec(), false).await.unwrap();
        assert_eq!(out.recv().await.unwrap().body, b"a");
        assert_eq!(out.recv().await.unwrap().body, b"b");
        assert_eq!(dfq.send_space(), 0);

        // a third frame stays queued until the peer grants a credit
        dfq.send(b"c".to_vec(), false).await.unwrap();
        assert!(out.try_recv().is_err());
        dfq.grant(1);
        assert_eq!(out.recv().await.unwrap().body, b"c");
        assert_eq!(dfq.send_space(), 0);
    }

    #[tokio::test]
    async fn test_deliver_grants_credits_on_consumption() {
        let (dfq, mut out) = queue(4);

        for i in 0..4u8 {
            dfq.deliver_data(vec![i]).unwrap();
        }
        // window full: a fifth frame means the peer overran its credits
        assert!(dfq.deliver_data(vec![9]).is_err());

        // consuming two frames crosses the threshold (4 / 2) and grants
        assert_eq!(dfq.next().await.unwrap(), vec![0]);
        assert_eq!(dfq.next().await.unwrap(), vec![1]);
        let frame = out.recv().await.unwrap();
        assert_eq!(
            wire::peek_reserved(&frame.body).unwrap(),
            Some(wire::ReservedMsg::Credits(2))
        );

        // draining the queue grants the remainder immediately
        assert_eq!(dfq.next().await.unwrap(), vec![2]);
        assert_eq!(dfq.next().await.unwrap(), vec![3]);
        let frame = out.recv().await.unwrap();
        assert_eq!(
            wire::peek_reserved(&frame.body).unwrap(),
            Some(wire::ReservedMsg::Credits(2))
        );
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_sender() {
        let (tx, _out) = unbounded_channel();
        let cancel = CancellationToken::new();
        let dfq = DuplexFlowQueue::new(1, FrameSender::new(1, tx), cancel.clone());

        // exhaust the credit, park one frame in the worker and fill the queue
        dfq.send(vec![0], false).await.unwrap();
        dfq.send(vec![1], false).await.unwrap();
        dfq.send(vec![2], false).await.unwrap();
        tokio::task::yield_now().await;

        let blocked = {
            let dfq = dfq.clone();
            tokio::spawn(async move { dfq.send(vec![3], false).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(blocked.await.unwrap(), Err(Error::TerminalEnded));
        assert!(dfq.next().await.is_none());
    }
}
