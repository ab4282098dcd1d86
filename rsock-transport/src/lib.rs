//! # rsock-transport
//!
//! Network transports for the rsock protocol engine.
//!
//! A byte-stream transport carries RSocket frames with a 3-byte big-endian
//! length prefix; this crate layers that framing over TCP and exposes the
//! result as the engine's [`Transport`](rsock_core::Transport) seam. The
//! same seam admits WebSocket or TLS variants without touching the engine.

pub mod tcp;

pub use tcp::{TcpServerTransport, TcpTransport};
