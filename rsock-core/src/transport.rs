//! Transport abstraction consumed by the connection.
//!
//! A transport is a duplex, message-oriented channel carrying whole encoded
//! frame bodies in order. Byte-stream transports (TCP) apply length-prefix
//! framing internally; message transports (in-process, WebSocket) map one
//! message to one frame.

use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Produced by the resumable wrapper when the grace period elapses.
    #[error("resume grace period elapsed")]
    ResumeTimeout,

    /// Produced by the resumable wrapper when the peer rejects a resume.
    #[error("resume rejected by peer: {0}")]
    ResumeRejected(String),
}

/// A duplex frame channel.
///
/// Frames passed to [`Transport::send`] are delivered to the peer in call
/// order; [`Transport::receive`] yields frames in arrival order. Both ends
/// observe [`TransportError::Closed`] once either side closes.
pub trait Transport: Send + Sync + 'static {
    /// Sends one encoded frame body.
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame body.
    fn receive(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Tears the transport down; pending and future operations fail.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// One end of an in-process transport pair.
///
/// Used by tests and same-process connections; frames cross a bounded
/// channel with no serialization beyond the frame codec.
pub struct InProcessTransport {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed_tx: watch::Sender<bool>,
}

/// Creates a connected pair of in-process transports.
pub fn in_process_pair(capacity: usize) -> (InProcessTransport, InProcessTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let left = InProcessTransport::new(a_tx, b_rx);
    let right = InProcessTransport::new(b_tx, a_rx);
    (left, right)
}

impl InProcessTransport {
    fn new(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed_tx,
        }
    }
}

impl Transport for InProcessTransport {
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send {
        let sender = self.tx.lock().clone();
        async move {
            match sender {
                Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
                None => Err(TransportError::Closed),
            }
        }
    }

    fn receive(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send {
        async move {
            let mut closed = self.closed_tx.subscribe();
            if *closed.borrow_and_update() {
                return Err(TransportError::Closed);
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                changed = closed.changed() => {
                    let _ = changed;
                    Err(TransportError::Closed)
                }
                frame = rx.recv() => frame.ok_or(TransportError::Closed),
            }
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.tx.lock().take();
            let _ = self.closed_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (left, right) = in_process_pair(4);
        left.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(right.receive().await.unwrap().as_ref(), b"hello");

        right.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(left.receive().await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let (left, right) = in_process_pair(16);
        for i in 0..10u8 {
            left.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(right.receive().await.unwrap()[0], i);
        }
    }

    #[tokio::test]
    async fn test_close_fails_both_ends() {
        let (left, right) = in_process_pair(4);
        left.close().await;

        assert!(matches!(
            left.receive().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            left.send(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        // Peer sees the channel closed too.
        assert!(matches!(
            right.receive().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (left, _right) = in_process_pair(4);
        let left = std::sync::Arc::new(left);
        let receiver = {
            let left = left.clone();
            tokio::spawn(async move { left.receive().await })
        };
        tokio::task::yield_now().await;
        left.close().await;
        assert!(matches!(
            receiver.await.unwrap(),
            Err(TransportError::Closed)
        ));
    }
}
