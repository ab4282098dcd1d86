//! Per-interaction-kind operations and the handles they expose.
//!
//! Each interaction kind has a requester half (issues the request frame and
//! registers routing state) and a responder half (spawns the application
//! handler under supervision). Shared plumbing lives here: the outbound
//! frame queue handle, the consumer-side [`PayloadStream`], and the
//! producer-side [`PayloadSink`] whose sends suspend on flow-control
//! credit.

pub(crate) mod fire_and_forget;
pub(crate) mod request_channel;
pub(crate) mod request_response;
pub(crate) mod request_stream;

use crate::error::StreamError;
use crate::flow::FlowController;
use crate::registry::{StreamItem, StreamLink, StreamRegistry};
use rsock_protocol::{ErrorCode, Frame, Payload};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Handle to the connection's outbound frame queue.
///
/// Sends are synchronous enqueues; the writer task serializes frames onto
/// the transport in order. Once the connection dies, sends fail
/// synchronously.
#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn send(&self, frame: Frame) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Connection("connection closed".to_string()));
        }
        self.tx
            .send(frame)
            .map_err(|_| StreamError::Connection("connection closed".to_string()))
    }

    /// Marks the connection dead; all subsequent sends fail.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Consumer handle for an inbound sequence of payloads.
///
/// Credit is granted to the remote emitter with [`PayloadStream::request`];
/// the emitter never sends more items than granted. Dropping the stream
/// before it terminated cancels it.
pub struct PayloadStream {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    frames: FrameSender,
    registry: Arc<StreamRegistry>,
    link: Option<Arc<StreamLink>>,
    terminated: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<StreamItem>,
        frames: FrameSender,
        registry: Arc<StreamRegistry>,
        link: Option<Arc<StreamLink>>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            frames,
            registry,
            link,
            terminated: false,
        }
    }

    /// Receives the next payload.
    ///
    /// Returns `None` once the sequence completed or was canceled locally;
    /// an error item is yielded once and the stream is terminal afterwards.
    pub async fn next(&mut self) -> Option<Result<Payload, StreamError>> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamItem::Next(payload)) => Some(Ok(payload)),
            Some(StreamItem::Complete) => {
                self.terminated = true;
                None
            }
            Some(StreamItem::Error(error)) => {
                self.terminated = true;
                Some(Err(error))
            }
            None => {
                self.terminated = true;
                Some(Err(StreamError::TerminatedPrematurely))
            }
        }
    }

    /// Grants the remote emitter credit for `n` more items.
    pub fn request(&self, n: u32) {
        if self.terminated || n == 0 {
            return;
        }
        let _ = self.frames.send(Frame::RequestN {
            stream_id: self.stream_id,
            request_n: n,
        });
    }

    /// Cancels the inbound sequence.
    ///
    /// Local delivery stops immediately; the remote emitter is told to stop
    /// with a Cancel frame, without waiting for acknowledgment. On a
    /// channel only this direction closes.
    pub fn cancel(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.rx.close();
        let _ = self.frames.send(Frame::Cancel {
            stream_id: self.stream_id,
        });
        match &self.link {
            Some(link) => {
                link.close_inbound();
                if link.fully_done() {
                    self.registry.remove(self.stream_id);
                }
            }
            None => {
                self.registry.remove(self.stream_id);
            }
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Producer handle for an outbound sequence of payloads.
///
/// Every send consumes one unit of credit and suspends until the remote
/// consumer has granted some. The sink observes remote cancellation as a
/// failed send.
pub struct PayloadSink {
    stream_id: u32,
    frames: FrameSender,
    flow: Arc<FlowController>,
    registry: Arc<StreamRegistry>,
    link: Arc<StreamLink>,
    complete_on_drop: bool,
    finished: bool,
}

impl PayloadSink {
    pub(crate) fn new(
        stream_id: u32,
        frames: FrameSender,
        flow: Arc<FlowController>,
        registry: Arc<StreamRegistry>,
        link: Arc<StreamLink>,
        complete_on_drop: bool,
    ) -> Self {
        Self {
            stream_id,
            frames,
            flow,
            registry,
            link,
            complete_on_drop,
            finished: false,
        }
    }

    /// Emits one payload, suspending until credit is available.
    ///
    /// Fails with [`StreamError::Canceled`] if the remote consumer canceled
    /// this direction, or once the sink is complete.
    pub async fn send(&mut self, payload: Payload) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Canceled);
        }
        if !self.flow.claim().await {
            self.finished = true;
            return Err(StreamError::Canceled);
        }
        self.frames.send(Frame::Payload {
            stream_id: self.stream_id,
            follows: false,
            complete: false,
            next: true,
            payload,
        })
    }

    /// Completes the outbound direction.
    pub fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.link.close_outbound() {
            return;
        }
        if !self.flow.is_closed() {
            let _ = self.frames.send(Frame::Payload {
                stream_id: self.stream_id,
                follows: false,
                complete: true,
                next: false,
                payload: Payload::empty(),
            });
        }
        if self.link.fully_done() {
            self.registry.remove(self.stream_id);
        }
    }

    /// Fails the stream with an application error.
    ///
    /// An error is terminal for the whole stream, both directions; the
    /// peer receives an Error frame with the error's wire code and message.
    pub fn error(mut self, error: StreamError) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.link.close_outbound() {
            return;
        }
        if !self.flow.is_closed() {
            let _ = self.frames.send(Frame::Error {
                stream_id: self.stream_id,
                code: error.wire_code(),
                message: error.wire_message(),
            });
        }
        self.link.close_inbound();
        self.registry.remove(self.stream_id);
    }

    /// Returns whether the remote consumer canceled this direction.
    pub fn is_canceled(&self) -> bool {
        self.flow.is_closed()
    }

    /// Credit currently available without suspending.
    pub fn available_credit(&self) -> i32 {
        self.flow.available()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Drop for PayloadSink {
    fn drop(&mut self) {
        if self.complete_on_drop {
            self.complete();
        }
    }
}

/// Spawns a responder handler task under supervision: a panic inside the
/// handler becomes an Error frame on its stream and never reaches the
/// connection's own tasks.
pub(crate) fn spawn_supervised<F>(
    stream_id: u32,
    frames: FrameSender,
    registry: Arc<StreamRegistry>,
    handler: F,
) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(handler);
    let abort = task.abort_handle();
    tokio::spawn(async move {
        if let Err(join_error) = task.await {
            if join_error.is_panic() {
                tracing::warn!("handler for stream {stream_id} panicked");
                let _ = frames.send(Frame::Error {
                    stream_id,
                    code: ErrorCode::APPLICATION_ERROR,
                    message: "handler panicked".to_string(),
                });
                registry.remove(stream_id);
            }
        }
    });
    abort
}

/// Terminal bookkeeping after a responder stream/channel handler resolves:
/// a clean return completes the outbound direction, an error terminates the
/// whole stream. Frames are suppressed when the peer already canceled.
pub(crate) fn finish_responder_outbound(
    stream_id: u32,
    frames: &FrameSender,
    registry: &Arc<StreamRegistry>,
    flow: &Arc<FlowController>,
    link: &Arc<StreamLink>,
    result: Result<(), StreamError>,
) {
    match result {
        Ok(()) => {
            if link.close_outbound() && !flow.is_closed() {
                let _ = frames.send(Frame::Payload {
                    stream_id,
                    follows: false,
                    complete: true,
                    next: false,
                    payload: Payload::empty(),
                });
            }
            if link.fully_done() {
                registry.remove(stream_id);
            }
        }
        Err(error) => {
            if link.close_outbound() && !flow.is_closed() {
                let _ = frames.send(Frame::Error {
                    stream_id,
                    code: error.wire_code(),
                    message: error.wire_message(),
                });
            }
            link.close_inbound();
            registry.remove(stream_id);
        }
    }
}
