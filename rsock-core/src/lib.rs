//! # rsock-core
//!
//! The RSocket protocol engine: stream multiplexing over a single duplex
//! connection, per-stream credit-based flow control, the four interaction
//! kinds (fire-and-forget, request-response, request-stream,
//! request-channel) on both requester and responder roles, connection
//! lifecycle with keepalive, and session resumption.
//!
//! The engine consumes any [`Transport`]: an ordered duplex channel of
//! encoded frames. [`in_process_pair`] provides a loopback transport;
//! network transports live in companion crates.
//!
//! ```no_run
//! use rsock_core::{accept, connect, AcceptConfig, Responder, SetupConfig};
//! use rsock_core::in_process_pair;
//! use rsock_protocol::Payload;
//!
//! # #[derive(Default)] struct MyResponder;
//! # impl Responder for MyResponder {}
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (a, b) = in_process_pair(64);
//! let client = connect(a, MyResponder::default(), SetupConfig::new()).await?;
//! let server = accept(b, MyResponder::default(), AcceptConfig::new()).await?;
//!
//! let reply = client
//!     .requester()
//!     .request_response(Payload::new("ping"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod flow;
pub mod keepalive;
pub mod operation;
pub mod responder;
pub mod resume;
pub mod setup;
pub mod transport;

mod registry;
#[cfg(test)]
mod testing;

pub use connection::{accept, connect, AcceptConfig, Connection, Requester};
pub use error::{ConnectionError, StreamError};
pub use flow::FlowController;
pub use keepalive::KeepAlive;
pub use operation::{PayloadSink, PayloadStream};
pub use responder::{RejectingResponder, Responder};
pub use resume::{
    accept_resumable, connect_resumable, generate_token, ResumeConfig, ResumeHandle, ResumeStore,
    ServerAccept,
};
pub use setup::{SetupConfig, SetupInfo};
pub use transport::{in_process_pair, InProcessTransport, Transport, TransportError};
