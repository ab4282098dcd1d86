//! Shared fixtures for the crate's tests.

use crate::connection::{accept, connect, AcceptConfig, Connection};
use crate::error::StreamError;
use crate::operation::{PayloadSink, PayloadStream};
use crate::responder::{RejectingResponder, Responder};
use crate::setup::SetupConfig;
use crate::transport::in_process_pair;
use rsock_protocol::Payload;
use std::future::Future;

/// Opt-in log output for tests (`RUST_LOG=debug cargo test ...`).
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connects a requester-only client to a server running `responder` over an
/// in-process transport pair.
pub(crate) async fn connected_pair<R: Responder>(responder: R) -> (Connection, Connection) {
    let (a, b) = in_process_pair(64);
    let (client, server) = tokio::join!(
        connect(a, RejectingResponder, SetupConfig::new()),
        accept(b, responder, AcceptConfig::new()),
    );
    (client.unwrap(), server.unwrap())
}

/// Echoes requests back:
/// - request-response returns the request payload
/// - request-stream emits `stream_items` numbered items
/// - request-channel echoes the initial payload and every inbound item
pub(crate) struct EchoResponder {
    pub stream_items: usize,
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self { stream_items: 10 }
    }
}

impl Responder for EchoResponder {
    fn request_response(
        &self,
        payload: Payload,
    ) -> impl Future<Output = Result<Payload, StreamError>> + Send {
        async move { Ok(payload) }
    }

    fn request_stream(
        &self,
        payload: Payload,
        mut output: PayloadSink,
    ) -> impl Future<Output = Result<(), StreamError>> + Send {
        let count = self.stream_items;
        async move {
            drop(payload);
            for i in 0..count {
                if output.send(Payload::new(format!("item-{i}"))).await.is_err() {
                    // Requester canceled; wind down quietly.
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    fn request_channel(
        &self,
        initial: Payload,
        mut input: PayloadStream,
        mut output: PayloadSink,
    ) -> impl Future<Output = Result<(), StreamError>> + Send {
        async move {
            if output.send(initial).await.is_err() {
                return Ok(());
            }
            input.request(64);
            while let Some(item) = input.next().await {
                match item {
                    Ok(payload) => {
                        if output.send(payload).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(_) => break,
                }
            }
            Ok(())
        }
    }
}
