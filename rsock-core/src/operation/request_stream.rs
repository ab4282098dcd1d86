//! Request-stream: one request frame, a flow-controlled sequence back.

use crate::error::StreamError;
use crate::flow::FlowController;
use crate::operation::{
    finish_responder_outbound, spawn_supervised, FrameSender, PayloadSink, PayloadStream,
};
use crate::registry::{StreamLink, StreamOp, StreamRegistry};
use crate::responder::Responder;
use parking_lot::Mutex;
use rsock_protocol::{ErrorCode, Frame, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Requester half: registers the item channel and sends the request frame
/// carrying the initial credit grant.
pub(crate) fn request(
    registry: &Arc<StreamRegistry>,
    frames: &FrameSender,
    payload: Payload,
    initial_request_n: u32,
) -> Result<PayloadStream, StreamError> {
    if initial_request_n == 0 {
        return Err(StreamError::with_code(
            ErrorCode::INVALID,
            "initial request-n must be positive",
        ));
    }
    let stream_id = registry.allocate()?;
    let (items, rx) = mpsc::unbounded_channel();
    registry.insert(stream_id, StreamOp::ReqStream { items });

    if let Err(error) = frames.send(Frame::RequestStream {
        stream_id,
        follows: false,
        initial_request_n,
        payload,
    }) {
        registry.remove(stream_id);
        return Err(error);
    }

    Ok(PayloadStream::new(
        stream_id,
        rx,
        frames.clone(),
        registry.clone(),
        None,
    ))
}

/// Responder half: the handler emits into a sink whose window starts at the
/// requester's initial request-N and grows on RequestN frames.
pub(crate) fn respond<R: Responder>(
    stream_id: u32,
    initial_request_n: u32,
    payload: Payload,
    responder: &Arc<R>,
    frames: &FrameSender,
    registry: &Arc<StreamRegistry>,
) {
    let flow = Arc::new(FlowController::with_initial(initial_request_n));
    // Outbound only: the inbound direction never opens.
    let link = Arc::new(StreamLink::new(true, false));
    registry.insert(
        stream_id,
        StreamOp::RespStream {
            flow: flow.clone(),
            abort: Mutex::new(None),
        },
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
        let result = responder.request_stream(payload, sink).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_pair, init_tracing, EchoResponder};
    use std::future::Future;
    use std::time::Duration;

    struct TwoThenFail;

    impl Responder for TwoThenFail {
        fn request_stream(
            &self,
            payload: Payload,
            mut output: PayloadSink,
        ) -> impl Future<Output = Result<(), StreamError>> + Send {
            async move {
                drop(payload);
                output.send(Payload::new("a")).await?;
                output.send(Payload::new("b")).await?;
                Err(StreamError::application("boom"))
            }
        }
    }

    async fn expect_pending(stream: &mut PayloadStream) {
        let poll = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(poll.is_err(), "emitter ran ahead of granted credit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emission_tracks_granted_credit() {
        init_tracing();
        let (client, server) = connected_pair(EchoResponder { stream_items: 10 }).await;

        let mut stream = client
            .requester()
            .request_stream(Payload::new("go"), 3)
            .unwrap();

        for i in 0..3 {
            let item = stream.next().await.unwrap().unwrap();
            assert_eq!(item.data().as_ref(), format!("item-{i}").as_bytes());
        }
        // Credit spent: the responder must be suspended now.
        expect_pending(&mut stream).await;

        stream.request(5);
        for i in 3..8 {
            let item = stream.next().await.unwrap().unwrap();
            assert_eq!(item.data().as_ref(), format!("item-{i}").as_bytes());
        }
        expect_pending(&mut stream).await;

        stream.request(10);
        for i in 8..10 {
            let item = stream.next().await.unwrap().unwrap();
            assert_eq!(item.data().as_ref(), format!("item-{i}").as_bytes());
        }
        // Ten items, then completion.
        assert!(stream.next().await.is_none());
        assert_eq!(server.active_streams(), 0);
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_local_delivery_and_responder() {
        init_tracing();
        let (client, server) = connected_pair(EchoResponder { stream_items: 10 }).await;

        let mut stream = client
            .requester()
            .request_stream(Payload::new("go"), 2)
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        stream.cancel();
        // Delivery stops immediately.
        assert!(stream.next().await.is_none());
        assert_eq!(client.active_streams(), 0);

        // The responder's handler observes its sink closed and winds down.
        for _ in 0..200 {
            if server.active_streams() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_error_reaches_consumer() {
        init_tracing();
        let (client, _server) = connected_pair(TwoThenFail).await;

        let mut stream = client
            .requester()
            .request_stream(Payload::new("go"), 10)
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().data().as_ref(), b"a");
        assert_eq!(stream.next().await.unwrap().unwrap().data().as_ref(), b"b");
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(StreamError::Application { ref message, .. }) if message == "boom"
        ));
        // Terminal after the error.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_initial_request_n_rejected_locally() {
        init_tracing();
        let (client, _server) = connected_pair(EchoResponder::default()).await;
        let result = client.requester().request_stream(Payload::new("go"), 0);
        assert!(
            matches!(result, Err(StreamError::Application { code, .. }) if code == ErrorCode::INVALID)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_inflight_stream() {
        init_tracing();
        let (client, server) = connected_pair(EchoResponder { stream_items: 100 }).await;

        {
            let mut stream = client
                .requester()
                .request_stream(Payload::new("go"), 1)
                .unwrap();
            assert!(stream.next().await.unwrap().is_ok());
            // Dropped here without completing.
        }

        for _ in 0..200 {
            if server.active_streams() == 0 && client.active_streams() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.active_streams(), 0);
        assert_eq!(server.active_streams(), 0);
    }
}
