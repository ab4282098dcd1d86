//! Request-response: one request frame, exactly one payload or error back.

use crate::error::StreamError;
use crate::operation::{spawn_supervised, FrameSender};
use crate::registry::{StreamOp, StreamRegistry};
use crate::responder::Responder;
use parking_lot::Mutex;
use rsock_protocol::{Frame, Payload};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Requester half.
///
/// Dropping the returned future before it resolves cancels the request: a
/// Cancel frame is sent without waiting for acknowledgment and the stream
/// entry is reclaimed. A late response for the canceled id is discarded by
/// the registry as an unknown-stream frame.
pub(crate) async fn request(
    registry: &Arc<StreamRegistry>,
    frames: &FrameSender,
    payload: Payload,
) -> Result<Payload, StreamError> {
    let stream_id = registry.allocate()?;
    let (tx, rx) = oneshot::channel();
    registry.insert(
        stream_id,
        StreamOp::ReqResponse {
            reply: Mutex::new(Some(tx)),
        },
    );
    if let Err(error) = frames.send(Frame::RequestResponse {
        stream_id,
        follows: false,
        payload,
    }) {
        registry.remove(stream_id);
        return Err(error);
    }

    let mut guard = CancelGuard {
        stream_id,
        frames: frames.clone(),
        registry: registry.clone(),
        armed: true,
    };
    let result = rx.await;
    guard.armed = false;
    match result {
        Ok(outcome) => outcome,
        // The reply slot vanished without resolving: connection teardown
        // raced the response.
        Err(_) => Err(StreamError::TerminatedPrematurely),
    }
}

struct CancelGuard {
    stream_id: u32,
    frames: FrameSender,
    registry: Arc<StreamRegistry>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Only bother the peer if the stream was still pending.
        if self.registry.remove(self.stream_id) {
            let _ = self.frames.send(Frame::Cancel {
                stream_id: self.stream_id,
            });
        }
    }
}

/// Responder half: runs the handler, answers with a completing payload or
/// an Error frame carrying the handler's wire code and message.
pub(crate) fn respond<R: Responder>(
    stream_id: u32,
    payload: Payload,
    responder: &Arc<R>,
    frames: &FrameSender,
    registry: &Arc<StreamRegistry>,
) {
    registry.insert(
        stream_id,
        StreamOp::RespResponse {
            abort: Mutex::new(None),
        },
    );

    let responder = responder.clone();
    let task_frames = frames.clone();
    let task_registry = registry.clone();
    let abort = spawn_supervised(stream_id, frames.clone(), registry.clone(), async move {
        let frame = match responder.request_response(payload).await {
            Ok(reply) => Frame::Payload {
                stream_id,
                follows: false,
                complete: true,
                next: true,
                payload: reply,
            },
            Err(error) => Frame::Error {
                stream_id,
                code: error.wire_code(),
                message: error.wire_message(),
            },
        };
        // Reclaim the entry first so a response and a racing peer frame
        // cannot double-handle the stream.
        task_registry.remove(stream_id);
        let _ = task_frames.send(frame);
    });
    registry.arm_abort(stream_id, abort);
}
