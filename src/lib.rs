//! # rsock
//!
//! An RSocket protocol engine: a multiplexed, bidirectional,
//! reactive-streaming protocol over a single duplex connection.
//!
//! One connection carries any number of independent logical streams, each
//! using one of four interaction kinds:
//!
//! - **fire-and-forget** — one payload, no response
//! - **request-response** — one payload each way
//! - **request-stream** — one payload out, a flow-controlled sequence back
//! - **request-channel** — flow-controlled sequences in both directions
//!
//! Backpressure is credit-based: a consumer grants request-N credit and the
//! emitter never sends more items than granted. Connections exchange
//! keepalives, and optionally buffer unacknowledged frames so a session
//! can resume over a fresh transport after connection loss.
//!
//! This crate is a facade over the workspace members: `rsock-protocol`
//! (wire format), `rsock-core` (the engine) and `rsock-transport` (TCP).
//!
//! ## Example
//!
//! ```no_run
//! use rsock::{
//!     accept, connect, AcceptConfig, Payload, RejectingResponder, Responder, SetupConfig,
//!     StreamError, TcpServerTransport, TcpTransport,
//! };
//!
//! struct Echo;
//!
//! impl Responder for Echo {
//!     fn request_response(
//!         &self,
//!         payload: Payload,
//!     ) -> impl std::future::Future<Output = Result<Payload, StreamError>> + Send {
//!         async move { Ok(payload) }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpServerTransport::bind("127.0.0.1:7878".parse()?).await?;
//!     tokio::spawn(async move {
//!         loop {
//!             let Ok((transport, _addr)) = listener.accept().await else { break };
//!             tokio::spawn(accept(transport, Echo, AcceptConfig::new()));
//!         }
//!     });
//!
//!     let transport = TcpTransport::connect("127.0.0.1:7878".parse()?).await?;
//!     let connection = connect(transport, RejectingResponder, SetupConfig::new()).await?;
//!     let reply = connection
//!         .requester()
//!         .request_response(Payload::new("ping"))
//!         .await?;
//!     println!("{:?}", reply.data());
//!     Ok(())
//! }
//! ```

pub use rsock_core::{
    accept, accept_resumable, connect, connect_resumable, generate_token, in_process_pair,
    AcceptConfig, Connection, ConnectionError, FlowController, InProcessTransport, KeepAlive,
    PayloadSink, PayloadStream, RejectingResponder, Requester, Responder, ResumeConfig,
    ResumeHandle, ResumeStore, ServerAccept, SetupConfig, SetupInfo, StreamError, Transport,
    TransportError,
};
pub use rsock_protocol::{ErrorCode, Frame, FrameType, Payload, Version};
pub use rsock_transport::{TcpServerTransport, TcpTransport};
