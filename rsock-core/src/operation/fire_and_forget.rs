//! Fire-and-forget: one request frame, no response tracking.

use crate::operation::FrameSender;
use crate::registry::StreamRegistry;
use crate::responder::Responder;
use crate::error::StreamError;
use rsock_protocol::{Frame, Payload};
use std::sync::Arc;

/// Requester half: allocates an id, sends the request frame and is done.
///
/// Send failures surface synchronously; there is no later signal.
pub(crate) fn request(
    registry: &Arc<StreamRegistry>,
    frames: &FrameSender,
    payload: Payload,
) -> Result<(), StreamError> {
    let stream_id = registry.allocate()?;
    frames.send(Frame::RequestFnf {
        stream_id,
        follows: false,
        payload,
    })
}

/// Responder half: runs the handler on its own task.
///
/// No registry entry is created: no frame can ever address this stream
/// again, and nothing is reported back to the peer.
pub(crate) fn respond<R: Responder>(responder: &Arc<R>, payload: Payload) {
    let responder = responder.clone();
    tokio::spawn(async move {
        responder.fire_and_forget(payload).await;
    });
}
