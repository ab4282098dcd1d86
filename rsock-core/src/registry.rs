//! Stream registry: id allocation, frame routing, stream teardown.

use crate::error::StreamError;
use crate::flow::FlowController;
use dashmap::DashMap;
use parking_lot::Mutex;
use rsock_protocol::{ErrorCode, Payload, MAX_STREAM_ID};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Which role this endpoint played in connection establishment; fixes the
/// stream id parity (initiating side odd, accepting side even).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

impl Side {
    fn first_stream_id(self) -> u64 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }
}

/// Item delivered to a local stream consumer.
pub(crate) enum StreamItem {
    Next(Payload),
    Complete,
    Error(StreamError),
}

/// Half-close bookkeeping for one stream.
///
/// A stream leaves the registry only when both directions are terminal.
/// Single-direction interactions pre-close the direction they never use.
pub(crate) struct StreamLink {
    outbound_done: AtomicBool,
    inbound_done: AtomicBool,
}

impl StreamLink {
    pub fn new(outbound_open: bool, inbound_open: bool) -> Self {
        Self {
            outbound_done: AtomicBool::new(!outbound_open),
            inbound_done: AtomicBool::new(!inbound_open),
        }
    }

    /// Marks the local-to-peer direction terminal; true if this call won.
    pub fn close_outbound(&self) -> bool {
        !self.outbound_done.swap(true, Ordering::AcqRel)
    }

    /// Marks the peer-to-local direction terminal; true if this call won.
    pub fn close_inbound(&self) -> bool {
        !self.inbound_done.swap(true, Ordering::AcqRel)
    }

    pub fn fully_done(&self) -> bool {
        self.outbound_done.load(Ordering::Acquire) && self.inbound_done.load(Ordering::Acquire)
    }
}

pub(crate) type ReplySlot = Mutex<Option<oneshot::Sender<Result<Payload, StreamError>>>>;
pub(crate) type AbortSlot = Mutex<Option<AbortHandle>>;

/// Role- and kind-specific routing state for one active stream.
pub(crate) enum StreamOp {
    /// Requester awaiting a single response.
    ReqResponse { reply: ReplySlot },
    /// Requester consuming a stream of payloads.
    ReqStream {
        items: mpsc::UnboundedSender<StreamItem>,
    },
    /// Requester side of a channel: inbound items plus outbound credit.
    ReqChannel {
        items: mpsc::UnboundedSender<StreamItem>,
        outbound: Arc<FlowController>,
        link: Arc<StreamLink>,
    },
    /// Responder computing a single response.
    RespResponse { abort: AbortSlot },
    /// Responder producing a stream under requester-granted credit.
    RespStream {
        flow: Arc<FlowController>,
        abort: AbortSlot,
    },
    /// Responder side of a channel.
    RespChannel {
        items: mpsc::UnboundedSender<StreamItem>,
        flow: Arc<FlowController>,
        link: Arc<StreamLink>,
        abort: AbortSlot,
    },
}

impl StreamOp {
    /// Terminal fan-out when the stream dies with the connection.
    fn fail(self, error: StreamError) {
        match self {
            StreamOp::ReqResponse { reply } => {
                if let Some(tx) = reply.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
            StreamOp::ReqStream { items } => {
                let _ = items.send(StreamItem::Error(error));
            }
            StreamOp::ReqChannel {
                items, outbound, ..
            } => {
                let _ = items.send(StreamItem::Error(error));
                outbound.close();
            }
            StreamOp::RespResponse { abort } => {
                if let Some(handle) = abort.lock().take() {
                    handle.abort();
                }
            }
            StreamOp::RespStream { flow, abort } => {
                flow.close();
                if let Some(handle) = abort.lock().take() {
                    handle.abort();
                }
            }
            StreamOp::RespChannel {
                items, flow, abort, ..
            } => {
                let _ = items.send(StreamItem::Error(error));
                flow.close();
                if let Some(handle) = abort.lock().take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Single authority for stream ids and inbound frame routing on one
/// connection.
pub(crate) struct StreamRegistry {
    streams: DashMap<u32, StreamOp>,
    next_id: AtomicU64,
    side: Side,
}

impl StreamRegistry {
    pub fn new(side: Side) -> Self {
        Self {
            streams: DashMap::new(),
            next_id: AtomicU64::new(side.first_stream_id()),
            side,
        }
    }

    /// Allocates the next locally-initiated stream id.
    ///
    /// Ids are monotonic and never reused; once the 31-bit space is spent,
    /// new stream creation fails fast.
    pub fn allocate(&self) -> Result<u32, StreamError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        if id > u64::from(MAX_STREAM_ID) {
            return Err(StreamError::IdsExhausted);
        }
        Ok(id as u32)
    }

    /// Returns whether `stream_id` has the peer's parity.
    pub fn is_peer_stream_id(&self, stream_id: u32) -> bool {
        match self.side {
            Side::Client => stream_id % 2 == 0,
            Side::Server => stream_id % 2 == 1,
        }
    }

    pub fn insert(&self, stream_id: u32, op: StreamOp) {
        debug_assert!(
            !self.streams.contains_key(&stream_id),
            "stream id {stream_id} reused while active"
        );
        self.streams.insert(stream_id, op);
    }

    /// Removes a stream entry; idempotent. Returns whether it was present.
    pub fn remove(&self, stream_id: u32) -> bool {
        self.streams.remove(&stream_id).is_some()
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Stores the abort handle for a responder task spawned after its entry
    /// was inserted.
    pub fn arm_abort(&self, stream_id: u32, handle: AbortHandle) {
        if let Some(entry) = self.streams.get(&stream_id) {
            match entry.value() {
                StreamOp::RespResponse { abort }
                | StreamOp::RespStream { abort, .. }
                | StreamOp::RespChannel { abort, .. } => {
                    *abort.lock() = Some(handle);
                }
                _ => {}
            }
        }
    }

    /// Routes an inbound Payload frame.
    pub fn on_payload(&self, stream_id: u32, next: bool, complete: bool, payload: Payload) {
        let Some(entry) = self.streams.get(&stream_id) else {
            tracing::debug!("dropping payload frame for unknown stream {stream_id}");
            return;
        };
        let mut remove = false;
        match entry.value() {
            StreamOp::ReqResponse { reply } => {
                if let Some(tx) = reply.lock().take() {
                    if next {
                        let _ = tx.send(Ok(payload));
                    } else {
                        // Completion without a payload: no response will come.
                        let _ = tx.send(Err(StreamError::TerminatedPrematurely));
                    }
                }
                remove = true;
            }
            StreamOp::ReqStream { items } => {
                if next {
                    let _ = items.send(StreamItem::Next(payload));
                }
                if complete {
                    let _ = items.send(StreamItem::Complete);
                    remove = true;
                }
            }
            StreamOp::ReqChannel { items, link, .. }
            | StreamOp::RespChannel { items, link, .. } => {
                if next {
                    let _ = items.send(StreamItem::Next(payload));
                }
                if complete {
                    let _ = items.send(StreamItem::Complete);
                    link.close_inbound();
                    remove = link.fully_done();
                }
            }
            _ => {
                tracing::warn!("payload frame for non-consuming stream {stream_id}");
            }
        }
        drop(entry);
        if remove {
            self.remove(stream_id);
        }
    }

    /// Routes an inbound Error frame for a stream.
    pub fn on_error(&self, stream_id: u32, code: ErrorCode, message: String) {
        let Some((_, op)) = self.streams.remove(&stream_id) else {
            tracing::debug!("dropping error frame for unknown stream {stream_id}");
            return;
        };
        let error = StreamError::from_wire(code, message);
        match op {
            StreamOp::ReqResponse { reply } => {
                if let Some(tx) = reply.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
            StreamOp::ReqStream { items } => {
                let _ = items.send(StreamItem::Error(error));
            }
            StreamOp::ReqChannel {
                items, outbound, ..
            } => {
                // An error is terminal for the whole stream, both directions.
                let _ = items.send(StreamItem::Error(error));
                outbound.close();
            }
            StreamOp::RespResponse { abort } => {
                if let Some(handle) = abort.lock().take() {
                    handle.abort();
                }
            }
            StreamOp::RespStream { flow, .. } => {
                flow.close();
            }
            StreamOp::RespChannel { items, flow, .. } => {
                let _ = items.send(StreamItem::Error(error));
                flow.close();
            }
        }
    }

    /// Routes an inbound RequestN frame (credit grant).
    pub fn on_request_n(&self, stream_id: u32, n: u32) {
        let Some(entry) = self.streams.get(&stream_id) else {
            tracing::debug!("dropping request-n frame for unknown stream {stream_id}");
            return;
        };
        match entry.value() {
            StreamOp::ReqChannel { outbound, .. } => outbound.grant(n),
            StreamOp::RespStream { flow, .. } | StreamOp::RespChannel { flow, .. } => {
                flow.grant(n)
            }
            _ => {
                tracing::warn!("request-n frame for non-emitting stream {stream_id}");
            }
        }
    }

    /// Routes an inbound Cancel frame: the peer stops consuming the
    /// direction we emit on. For channels only that direction closes; the
    /// stream survives until its other direction is also terminal.
    pub fn on_cancel(&self, stream_id: u32) {
        let Some(entry) = self.streams.get(&stream_id) else {
            tracing::debug!("dropping cancel frame for unknown stream {stream_id}");
            return;
        };
        let mut remove = false;
        match entry.value() {
            StreamOp::ReqChannel { outbound, link, .. } => {
                outbound.close();
                link.close_outbound();
                remove = link.fully_done();
            }
            StreamOp::RespResponse { abort } => {
                if let Some(handle) = abort.lock().take() {
                    handle.abort();
                }
                remove = true;
            }
            StreamOp::RespStream { flow, .. } => {
                flow.close();
                remove = true;
            }
            StreamOp::RespChannel { flow, link, .. } => {
                flow.close();
                link.close_outbound();
                remove = link.fully_done();
            }
            _ => {
                tracing::warn!("cancel frame for non-emitting stream {stream_id}");
            }
        }
        drop(entry);
        if remove {
            self.remove(stream_id);
        }
    }

    /// Fails every active stream; used when the connection dies.
    pub fn fail_all(&self, error: &StreamError) {
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, op)) = self.streams.remove(&id) {
                op.fail(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_parity() {
        let client = StreamRegistry::new(Side::Client);
        assert_eq!(client.allocate().unwrap(), 1);
        assert_eq!(client.allocate().unwrap(), 3);

        let server = StreamRegistry::new(Side::Server);
        assert_eq!(server.allocate().unwrap(), 2);
        assert_eq!(server.allocate().unwrap(), 4);
    }

    #[test]
    fn test_peer_stream_id() {
        let client = StreamRegistry::new(Side::Client);
        assert!(client.is_peer_stream_id(2));
        assert!(!client.is_peer_stream_id(1));

        let server = StreamRegistry::new(Side::Server);
        assert!(server.is_peer_stream_id(1));
        assert!(!server.is_peer_stream_id(2));
    }

    #[test]
    fn test_id_exhaustion_fails_fast() {
        let registry = StreamRegistry::new(Side::Client);
        registry
            .next_id
            .store(u64::from(MAX_STREAM_ID), Ordering::Relaxed);
        // The last odd id is still usable, then allocation fails for good.
        assert_eq!(registry.allocate().unwrap(), MAX_STREAM_ID);
        assert!(matches!(
            registry.allocate(),
            Err(StreamError::IdsExhausted)
        ));
        assert!(matches!(
            registry.allocate(),
            Err(StreamError::IdsExhausted)
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = StreamRegistry::new(Side::Client);
        let (tx, _rx) = oneshot::channel();
        registry.insert(
            1,
            StreamOp::ReqResponse {
                reply: Mutex::new(Some(tx)),
            },
        );
        assert!(registry.contains(1));
        assert!(registry.remove(1));
        assert!(!registry.remove(1));
    }

    #[test]
    fn test_payload_routing_to_stream() {
        let registry = StreamRegistry::new(Side::Client);
        let (items, mut rx) = mpsc::unbounded_channel();
        registry.insert(1, StreamOp::ReqStream { items });

        registry.on_payload(1, true, false, Payload::new("a"));
        registry.on_payload(1, true, true, Payload::new("b"));

        assert!(matches!(rx.try_recv().unwrap(), StreamItem::Next(p) if p.data().as_ref() == b"a"));
        assert!(matches!(rx.try_recv().unwrap(), StreamItem::Next(p) if p.data().as_ref() == b"b"));
        assert!(matches!(rx.try_recv().unwrap(), StreamItem::Complete));
        // Completion removed the entry.
        assert!(!registry.contains(1));
    }

    #[test]
    fn test_unknown_stream_frames_dropped_silently() {
        let registry = StreamRegistry::new(Side::Server);
        registry.on_payload(17, true, false, Payload::new("late"));
        registry.on_error(17, ErrorCode::APPLICATION_ERROR, "late".into());
        registry.on_request_n(17, 5);
        registry.on_cancel(17);
    }

    #[test]
    fn test_fail_all_delivers_connection_error() {
        let registry = StreamRegistry::new(Side::Client);
        let (tx, mut rx) = oneshot::channel();
        registry.insert(
            1,
            StreamOp::ReqResponse {
                reply: Mutex::new(Some(tx)),
            },
        );
        let (items, mut items_rx) = mpsc::unbounded_channel();
        registry.insert(3, StreamOp::ReqStream { items });

        registry.fail_all(&StreamError::Connection("gone".into()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(StreamError::Connection(_))
        ));
        assert!(matches!(
            items_rx.try_recv().unwrap(),
            StreamItem::Error(StreamError::Connection(_))
        ));
        assert_eq!(registry.active_streams(), 0);
    }

    #[test]
    fn test_cancel_closes_only_one_channel_direction() {
        let registry = StreamRegistry::new(Side::Server);
        let (items, _items_rx) = mpsc::unbounded_channel();
        let flow = Arc::new(FlowController::with_initial(5));
        let link = Arc::new(StreamLink::new(true, true));
        registry.insert(
            2,
            StreamOp::RespChannel {
                items,
                flow: flow.clone(),
                link: link.clone(),
                abort: Mutex::new(None),
            },
        );

        registry.on_cancel(2);
        assert!(flow.is_closed());
        // Inbound direction still open, stream still registered.
        assert!(!link.fully_done());
        assert!(registry.contains(2));

        registry.on_payload(2, false, true, Payload::empty());
        assert!(link.fully_done());
        assert!(!registry.contains(2));
    }
}
