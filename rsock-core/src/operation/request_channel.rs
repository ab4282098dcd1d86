//! Request-channel: a duplex exchange with independent directions.
//!
//! Each direction is its own flow-controlled sequence and reaches
//! completion independently; the stream leaves the registry only when both
//! directions are terminal, or at once when either side errors.

use crate::error::StreamError;
use crate::flow::FlowController;
use crate::operation::{
    finish_responder_outbound, spawn_supervised, FrameSender, PayloadSink, PayloadStream,
};
use crate::registry::{StreamItem, StreamLink, StreamOp, StreamRegistry};
use crate::responder::Responder;
use parking_lot::Mutex;
use rsock_protocol::{ErrorCode, Frame, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Requester half.
///
/// The initial payload travels in the request frame as the first
/// requester-to-responder item; further items go through the returned sink
/// once the responder grants credit. The returned stream consumes the
/// responder-to-requester direction under `initial_request_n` initial
/// credit.
pub(crate) fn request(
    registry: &Arc<StreamRegistry>,
    frames: &FrameSender,
    initial_payload: Payload,
    initial_request_n: u32,
) -> Result<(PayloadSink, PayloadStream), StreamError> {
    if initial_request_n == 0 {
        return Err(StreamError::with_code(
            ErrorCode::INVALID,
            "initial request-n must be positive",
        ));
    }
    let stream_id = registry.allocate()?;
    let (items, rx) = mpsc::unbounded_channel();
    let outbound = Arc::new(FlowController::new());
    let link = Arc::new(StreamLink::new(true, true));
    registry.insert(
        stream_id,
        StreamOp::ReqChannel {
            items,
            outbound: outbound.clone(),
            link: link.clone(),
        },
    );

    if let Err(error) = frames.send(Frame::RequestChannel {
        stream_id,
        follows: false,
        complete: false,
        initial_request_n,
        payload: initial_payload,
    }) {
        registry.remove(stream_id);
        return Err(error);
    }

    let sink = PayloadSink::new(
        stream_id,
        frames.clone(),
        outbound,
        registry.clone(),
        link.clone(),
        true,
    );
    let stream = PayloadStream::new(stream_id, rx, frames.clone(), registry.clone(), Some(link));
    Ok((sink, stream))
}

/// Responder half.
///
/// The handler receives the initial payload, an inbound stream of further
/// requester items (it grants credit for them itself), and a sink for its
/// own direction seeded with the requester's initial request-N.
pub(crate) fn respond<R: Responder>(
    stream_id: u32,
    initial_request_n: u32,
    complete: bool,
    payload: Payload,
    responder: &Arc<R>,
    frames: &FrameSender,
    registry: &Arc<StreamRegistry>,
) {
    let (items, rx) = mpsc::unbounded_channel();
    let flow = Arc::new(FlowController::with_initial(initial_request_n));
    let link = Arc::new(StreamLink::new(true, !complete));
    if complete {
        // The requester half-closed its direction at open.
        let _ = items.send(StreamItem::Complete);
    }
    registry.insert(
        stream_id,
        StreamOp::RespChannel {
            items,
            flow: flow.clone(),
            link: link.clone(),
            abort: Mutex::new(None),
        },
    );

    let inbound = PayloadStream::new(
        stream_id,
        rx,
        frames.clone(),
        registry.clone(),
        Some(link.clone()),
    );
    let sink = PayloadSink::new(
        stream_id,
        frames.clone(),
        flow.clone(),
        registry.clone(),
        link.clone(),
        false,
    );
    let responder = responder.clone();
    let task_frames = frames.clone();
    let task_registry = registry.clone();
    let abort = spawn_supervised(stream_id, frames.clone(), registry.clone(), async move {
        let result = responder.request_channel(payload, inbound, sink).await;
        finish_responder_outbound(
            stream_id,
            &task_frames,
            &task_registry,
            &flow,
            &link,
            result,
        );
    });
    registry.arm_abort(stream_id, abort);
}
