//! Application-side request handling.

use crate::error::StreamError;
use crate::operation::{PayloadSink, PayloadStream};
use bytes::Bytes;
use rsock_protocol::Payload;
use std::future::Future;

/// Handlers for inbound requests.
///
/// One responder serves a whole connection; each inbound request runs on
/// its own task, concurrently with frame dispatch and with other streams. A
/// handler returning an error (or panicking) terminates only its own
/// stream: the peer receives an Error frame with the handler's wire code
/// and message, and sibling streams are untouched.
///
/// Every method has a default: requests that expect an answer are rejected
/// with [`REJECTED`](rsock_protocol::ErrorCode::REJECTED), the rest drop
/// their input.
pub trait Responder: Send + Sync + 'static {
    /// Handles a fire-and-forget request. There is no way to respond.
    fn fire_and_forget(&self, payload: Payload) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("unhandled fire-and-forget request");
            drop(payload);
        }
    }

    /// Handles a request-response interaction.
    fn request_response(
        &self,
        payload: Payload,
    ) -> impl Future<Output = Result<Payload, StreamError>> + Send {
        async move {
            drop(payload);
            Err(StreamError::rejected("request-response not supported"))
        }
    }

    /// Handles a request-stream interaction by emitting into `output`.
    ///
    /// Sends suspend while the requester has granted no credit. A clean
    /// return completes the stream; returning an error sends it to the
    /// requester instead.
    fn request_stream(
        &self,
        payload: Payload,
        output: PayloadSink,
    ) -> impl Future<Output = Result<(), StreamError>> + Send {
        async move {
            drop((payload, output));
            Err(StreamError::rejected("request-stream not supported"))
        }
    }

    /// Handles a request-channel interaction.
    ///
    /// `initial` is the requester's first item; further items arrive on
    /// `input` as the handler grants credit for them. `output` works as in
    /// [`Responder::request_stream`] and the two directions complete
    /// independently.
    fn request_channel(
        &self,
        initial: Payload,
        input: PayloadStream,
        output: PayloadSink,
    ) -> impl Future<Output = Result<(), StreamError>> + Send {
        async move {
            drop((initial, input, output));
            Err(StreamError::rejected("request-channel not supported"))
        }
    }

    /// Handles connection-level metadata pushed by the peer.
    fn metadata_push(&self, metadata: Bytes) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("unhandled metadata push ({} bytes)", metadata.len());
        }
    }
}

/// A responder that rejects every request; useful for requester-only
/// endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingResponder;

impl Responder for RejectingResponder {}
