//! Connection lifecycle: setup handshake, frame dispatch, keepalive.
//!
//! Each connection runs three tasks: a reader pumping transport frames into
//! a bounded queue, a single dispatch task that decodes and routes them (so
//! frame processing never runs concurrently with itself), and a writer
//! serializing the outbound frame queue onto the transport. Responder
//! handlers run on their own tasks, concurrently with dispatch.

use crate::error::{ConnectionError, StreamError};
use crate::keepalive::KeepAlive;
use crate::operation::{self, FrameSender, PayloadSink, PayloadStream};
use crate::registry::{Side, StreamRegistry};
use crate::responder::Responder;
use crate::resume::ResumeSession;
use crate::setup::{SetupConfig, SetupInfo};
use crate::transport::{Transport, TransportError};
use bytes::Bytes;
use parking_lot::Mutex;
use rsock_protocol::{ErrorCode, Frame, Payload, Version};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

/// Frames buffered between the reader task and the dispatch task.
const INBOUND_QUEUE: usize = 64;

/// Configuration for the accepting side.
#[derive(Debug, Clone)]
pub struct AcceptConfig {
    /// How long to wait for the peer's Setup frame.
    pub setup_timeout: Duration,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl AcceptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

/// State shared by the connection's tasks and every stream handle.
pub(crate) struct ConnShared {
    pub(crate) registry: Arc<StreamRegistry>,
    pub(crate) frames: FrameSender,
    pub(crate) resume: Option<Arc<ResumeSession>>,
    state: watch::Sender<bool>,
    error: Mutex<Option<Arc<ConnectionError>>>,
}

impl ConnShared {
    /// Records the first fatal error, fails every stream and stops the
    /// connection tasks. Later calls are no-ops.
    pub(crate) fn fatal(&self, error: ConnectionError) {
        let stream_error;
        {
            let mut slot = self.error.lock();
            if slot.is_some() {
                return;
            }
            tracing::info!("connection closing: {error}");
            stream_error = StreamError::Connection(error.to_string());
            *slot = Some(Arc::new(error));
        }
        self.frames.mark_closed();
        self.registry.fail_all(&stream_error);
        let _ = self.state.send(true);
    }

    pub(crate) fn error(&self) -> Option<Arc<ConnectionError>> {
        self.error.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.state.borrow()
    }

    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// A live connection to a peer.
///
/// The connection is independent of the handle: dropping a `Connection`
/// does not close it. Use [`Connection::close`] for an orderly shutdown.
pub struct Connection {
    shared: Arc<ConnShared>,
    peer_setup: Option<SetupInfo>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnShared>, peer_setup: Option<SetupInfo>) -> Self {
        Self { shared, peer_setup }
    }

    /// Returns a handle for issuing requests on this connection.
    pub fn requester(&self) -> Requester {
        Requester {
            shared: self.shared.clone(),
        }
    }

    /// The peer's setup parameters (accepting side only).
    pub fn peer_setup(&self) -> Option<&SetupInfo> {
        self.peer_setup.as_ref()
    }

    /// Number of currently active streams; diagnostics only.
    pub fn active_streams(&self) -> usize {
        self.shared.registry.active_streams()
    }

    /// Closes the connection in an orderly fashion.
    ///
    /// The peer is told via a CONNECTION_CLOSE error frame; every
    /// outstanding local call fails with a connection error.
    pub fn close(&self) {
        let _ = self.shared.frames.send(Frame::Error {
            stream_id: 0,
            code: ErrorCode::CONNECTION_CLOSE,
            message: "connection closed".to_string(),
        });
        self.shared.fatal(ConnectionError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits until the connection is closed and returns the cause.
    pub async fn closed(&self) -> Arc<ConnectionError> {
        self.shared.wait_closed().await;
        self.shared
            .error()
            .unwrap_or_else(|| Arc::new(ConnectionError::Closed))
    }
}

/// Requester handle: the four interaction verbs plus metadata push.
#[derive(Clone)]
pub struct Requester {
    shared: Arc<ConnShared>,
}

impl Requester {
    /// Sends a request with no response tracking. Failure to enqueue
    /// surfaces synchronously; there is no later signal.
    pub fn fire_and_forget(&self, payload: Payload) -> Result<(), StreamError> {
        operation::fire_and_forget::request(&self.shared.registry, &self.shared.frames, payload)
    }

    /// Sends a request and resolves with the single response payload or the
    /// peer's error. Dropping the future cancels the request on the wire.
    pub async fn request_response(&self, payload: Payload) -> Result<Payload, StreamError> {
        operation::request_response::request(&self.shared.registry, &self.shared.frames, payload)
            .await
    }

    /// Opens a stream of payloads from the responder, granting it
    /// `initial_request_n` items of credit up front.
    pub fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
    ) -> Result<PayloadStream, StreamError> {
        operation::request_stream::request(
            &self.shared.registry,
            &self.shared.frames,
            payload,
            initial_request_n,
        )
    }

    /// Opens a bidirectional channel. `initial` travels with the request as
    /// the first outbound item; the returned sink carries further outbound
    /// items (credit arrives from the responder), the returned stream
    /// yields the responder's items.
    pub fn request_channel(
        &self,
        initial: Payload,
        initial_request_n: u32,
    ) -> Result<(PayloadSink, PayloadStream), StreamError> {
        operation::request_channel::request(
            &self.shared.registry,
            &self.shared.frames,
            initial,
            initial_request_n,
        )
    }

    /// Pushes connection-level metadata to the peer.
    pub fn metadata_push(&self, metadata: Bytes) -> Result<(), StreamError> {
        self.shared.frames.send(Frame::MetadataPush { metadata })
    }
}

/// Establishes a connection as the initiating side.
///
/// The Setup frame is sent immediately; there is no acknowledgment to wait
/// for. The responder serves inbound requests from the peer.
pub async fn connect<T, R>(
    transport: T,
    responder: R,
    setup: SetupConfig,
) -> Result<Connection, ConnectionError>
where
    T: Transport,
    R: Responder,
{
    let keep_alive = setup.keep_alive;
    let shared = start(
        Arc::new(transport),
        Arc::new(responder),
        Side::Client,
        keep_alive,
        None,
        Some(setup.into_frame()),
    );
    Ok(Connection::new(shared, None))
}

/// Establishes a connection as the accepting side.
///
/// Waits for the peer's Setup frame, validates it (version mismatch is a
/// hard rejection) and adopts the peer's keepalive configuration.
pub async fn accept<T, R>(
    transport: T,
    responder: R,
    config: AcceptConfig,
) -> Result<Connection, ConnectionError>
where
    T: Transport,
    R: Responder,
{
    let frame = first_frame(&transport, config.setup_timeout).await?;
    let info = match SetupInfo::from_frame(frame) {
        Some(info) => info,
        None => {
            let message = "expected setup frame";
            reject_with(&transport, ErrorCode::INVALID_SETUP, message).await;
            return Err(ConnectionError::SetupRejected {
                code: ErrorCode::INVALID_SETUP,
                message: message.to_string(),
            });
        }
    };
    validate_setup_version(&transport, &info).await?;
    if info.resume_token.is_some() {
        let message = "resumption not enabled";
        reject_with(&transport, ErrorCode::UNSUPPORTED_SETUP, message).await;
        return Err(ConnectionError::SetupRejected {
            code: ErrorCode::UNSUPPORTED_SETUP,
            message: message.to_string(),
        });
    }

    let keep_alive = info.keep_alive;
    let shared = start(
        Arc::new(transport),
        Arc::new(responder),
        Side::Server,
        keep_alive,
        None,
        None,
    );
    Ok(Connection::new(shared, Some(info)))
}

/// Reads the first frame of a fresh transport (setup or resume).
pub(crate) async fn first_frame<T: Transport>(
    transport: &T,
    timeout: Duration,
) -> Result<Frame, ConnectionError> {
    let bytes = tokio::time::timeout(timeout, transport.receive())
        .await
        .map_err(|_| ConnectionError::SetupTimeout)?
        .map_err(ConnectionError::from)?;
    Ok(Frame::decode(bytes)?)
}

/// Sends a connection-level error and tears the transport down; used to
/// refuse a connection before it is established.
pub(crate) async fn reject_with<T: Transport>(transport: &T, code: ErrorCode, message: &str) {
    let frame = Frame::Error {
        stream_id: 0,
        code,
        message: message.to_string(),
    };
    if let Ok(bytes) = frame.encode() {
        let _ = transport.send(bytes).await;
    }
    transport.close().await;
}

pub(crate) async fn validate_setup_version<T: Transport>(
    transport: &T,
    info: &SetupInfo,
) -> Result<(), ConnectionError> {
    if info.version == Version::CURRENT {
        return Ok(());
    }
    let message = format!("unsupported protocol version {}", info.version);
    reject_with(transport, ErrorCode::INVALID_SETUP, &message).await;
    Err(ConnectionError::UnsupportedVersion {
        expected: Version::CURRENT,
        actual: info.version,
    })
}

/// Wires up the shared state and spawns the connection tasks.
pub(crate) fn start<T, R>(
    transport: Arc<T>,
    responder: Arc<R>,
    side: Side,
    keep_alive: KeepAlive,
    resume: Option<Arc<ResumeSession>>,
    first_frame: Option<Frame>,
) -> Arc<ConnShared>
where
    T: Transport,
    R: Responder,
{
    let (frames, frame_rx) = FrameSender::new();
    let (state, _) = watch::channel(false);
    let shared = Arc::new(ConnShared {
        registry: Arc::new(StreamRegistry::new(side)),
        frames,
        resume,
        state,
        error: Mutex::new(None),
    });

    // The setup (or resume) frame must precede anything the dispatch task
    // emits, so it is queued before the tasks exist.
    if let Some(frame) = first_frame {
        let _ = shared.frames.send(frame);
    }

    tokio::spawn(run_writer(transport.clone(), frame_rx, shared.clone()));
    tokio::spawn(run_dispatch(transport, responder, shared.clone(), keep_alive));
    shared
}

/// Serializes the outbound frame queue onto the transport.
async fn run_writer<T: Transport>(
    transport: Arc<T>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<ConnShared>,
) {
    let mut closed = shared.state.subscribe();
    loop {
        tokio::select! {
            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                if !write_frame(&transport, frame, &shared).await {
                    break;
                }
            }
            _ = closed.changed() => {
                // Flush whatever was queued before the close (e.g. the
                // closing error frame), then stop.
                while let Ok(frame) = frame_rx.try_recv() {
                    if !write_frame(&transport, frame, &shared).await {
                        break;
                    }
                }
                break;
            }
        }
    }
    transport.close().await;
}

async fn write_frame<T: Transport>(
    transport: &Arc<T>,
    frame: Frame,
    shared: &Arc<ConnShared>,
) -> bool {
    tracing::debug!("sending {frame}");
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(error) => {
            shared.fatal(error.into());
            return false;
        }
    };
    if let Err(error) = transport.send(bytes).await {
        shared.fatal(error.into());
        return false;
    }
    true
}

/// Pumps inbound frames through the dispatch loop and converts its exit
/// into connection teardown.
async fn run_dispatch<T, R>(
    transport: Arc<T>,
    responder: Arc<R>,
    shared: Arc<ConnShared>,
    keep_alive: KeepAlive,
) where
    T: Transport,
    R: Responder,
{
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let reader_transport = transport.clone();
    let reader = tokio::spawn(async move {
        loop {
            let result = reader_transport.receive().await;
            let failed = result.is_err();
            if inbound_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    match dispatch_loop(&mut inbound_rx, &responder, &shared, keep_alive).await {
        Ok(()) => shared.fatal(ConnectionError::Closed),
        Err(error) => {
            // Locally-detected failures are reported to the peer before the
            // writer drains; transport deaths and peer errors are not.
            match &error {
                ConnectionError::KeepAliveTimeout(_) | ConnectionError::Frame(_) => {
                    let _ = shared.frames.send(Frame::Error {
                        stream_id: 0,
                        code: ErrorCode::CONNECTION_ERROR,
                        message: error.to_string(),
                    });
                }
                _ => {}
            }
            shared.fatal(error);
        }
    }
    reader.abort();
}

async fn dispatch_loop<R: Responder>(
    inbound_rx: &mut mpsc::Receiver<Result<Bytes, TransportError>>,
    responder: &Arc<R>,
    shared: &Arc<ConnShared>,
    keep_alive: KeepAlive,
) -> Result<(), ConnectionError> {
    let mut closed = shared.state.subscribe();
    let mut ticker = interval(keep_alive.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness_deadline = Instant::now() + keep_alive.max_lifetime;

    loop {
        tokio::select! {
            _ = closed.changed() => return Ok(()),
            _ = ticker.tick() => {
                let position = shared.resume.as_ref().map_or(0, |s| s.received_position());
                let _ = shared.frames.send(Frame::KeepAlive {
                    respond: true,
                    last_received_position: position,
                    data: Bytes::new(),
                });
            }
            _ = sleep_until(liveness_deadline) => {
                // A suspended resumable session is governed by the resume
                // grace period, not the keepalive deadline.
                if shared.resume.as_ref().is_some_and(|s| s.is_suspended()) {
                    liveness_deadline = Instant::now() + keep_alive.max_lifetime;
                } else {
                    return Err(ConnectionError::KeepAliveTimeout(keep_alive.max_lifetime));
                }
            }
            received = inbound_rx.recv() => {
                let bytes = match received {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(error)) => return Err(error.into()),
                    None => return Err(ConnectionError::Closed),
                };
                liveness_deadline = Instant::now() + keep_alive.max_lifetime;
                let frame = Frame::decode(bytes)?;
                handle_frame(frame, responder, shared)?;
            }
        }
    }
}

/// Routes one inbound frame. Runs on the dispatch task only.
fn handle_frame<R: Responder>(
    frame: Frame,
    responder: &Arc<R>,
    shared: &Arc<ConnShared>,
) -> Result<(), ConnectionError> {
    tracing::debug!("received {frame}");
    match frame {
        Frame::Ignore => {}
        Frame::Setup { .. } => {
            tracing::warn!("ignoring setup frame on established connection");
        }
        Frame::Lease {
            ttl_ms,
            number_of_requests,
            ..
        } => {
            // Wire-level extension point only; no admission policy here.
            tracing::debug!(
                "ignoring lease (ttl={ttl_ms}ms, requests={number_of_requests})"
            );
        }
        Frame::KeepAlive {
            respond,
            last_received_position,
            data,
        } => {
            if let Some(session) = &shared.resume {
                session.acknowledge(last_received_position);
            }
            if respond {
                let position = shared.resume.as_ref().map_or(0, |s| s.received_position());
                let _ = shared.frames.send(Frame::KeepAlive {
                    respond: false,
                    last_received_position: position,
                    data,
                });
            }
        }
        Frame::Error {
            stream_id: 0,
            code,
            message,
        } => {
            return Err(ConnectionError::PeerError { code, message });
        }
        Frame::Error {
            stream_id,
            code,
            message,
        } => shared.registry.on_error(stream_id, code, message),
        Frame::MetadataPush { metadata } => {
            let responder = responder.clone();
            tokio::spawn(async move {
                responder.metadata_push(metadata).await;
            });
        }
        Frame::Resume { .. } | Frame::ResumeOk { .. } => {
            tracing::warn!("ignoring resume frame on established connection");
        }
        Frame::RequestFnf { stream_id, payload, .. } => {
            if shared.registry.is_peer_stream_id(stream_id) {
                operation::fire_and_forget::respond(responder, payload);
            } else {
                tracing::warn!("fire-and-forget with local-parity stream id {stream_id}");
            }
        }
        Frame::RequestResponse { stream_id, payload, .. } => {
            if accepts_new_stream(shared, stream_id) {
                operation::request_response::respond(
                    stream_id,
                    payload,
                    responder,
                    &shared.frames,
                    &shared.registry,
                );
            }
        }
        Frame::RequestStream {
            stream_id,
            initial_request_n,
            payload,
            ..
        } => {
            if accepts_new_stream(shared, stream_id) {
                operation::request_stream::respond(
                    stream_id,
                    initial_request_n,
                    payload,
                    responder,
                    &shared.frames,
                    &shared.registry,
                );
            }
        }
        Frame::RequestChannel {
            stream_id,
            complete,
            initial_request_n,
            payload,
            ..
        } => {
            if accepts_new_stream(shared, stream_id) {
                operation::request_channel::respond(
                    stream_id,
                    initial_request_n,
                    complete,
                    payload,
                    responder,
                    &shared.frames,
                    &shared.registry,
                );
            }
        }
        Frame::RequestN { stream_id, request_n } => {
            shared.registry.on_request_n(stream_id, request_n);
        }
        Frame::Cancel { stream_id } => shared.registry.on_cancel(stream_id),
        Frame::Payload {
            stream_id,
            complete,
            next,
            payload,
            ..
        } => shared.registry.on_payload(stream_id, next, complete, payload),
        Frame::Ext { extended_type, .. } => {
            tracing::warn!("ignoring ext frame (type {extended_type:#x})");
        }
    }
    Ok(())
}

/// A Request* frame opens a new responder stream only for an unused id of
/// the peer's parity.
fn accepts_new_stream(shared: &Arc<ConnShared>, stream_id: u32) -> bool {
    if !shared.registry.is_peer_stream_id(stream_id) {
        tracing::warn!("request frame with local-parity stream id {stream_id}");
        return false;
    }
    if shared.registry.contains(stream_id) {
        tracing::warn!("request frame for already-active stream {stream_id}");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::RejectingResponder;
    use crate::testing::{connected_pair, init_tracing, EchoResponder};
    use crate::transport::in_process_pair;
    use std::time::Duration;

    struct RecordingResponder {
        fnf: Arc<Mutex<Vec<Bytes>>>,
        pushes: Arc<Mutex<Vec<Bytes>>>,
    }

    impl RecordingResponder {
        fn new() -> Self {
            Self {
                fnf: Arc::new(Mutex::new(Vec::new())),
                pushes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Responder for RecordingResponder {
        fn request_response(
            &self,
            payload: Payload,
        ) -> impl std::future::Future<Output = Result<Payload, StreamError>> + Send {
            async move { Ok(payload) }
        }

        fn fire_and_forget(
            &self,
            payload: Payload,
        ) -> impl std::future::Future<Output = ()> + Send {
            let seen = self.fnf.clone();
            async move {
                seen.lock().push(payload.data().clone());
            }
        }

        fn metadata_push(
            &self,
            metadata: Bytes,
        ) -> impl std::future::Future<Output = ()> + Send {
            let seen = self.pushes.clone();
            async move {
                seen.lock().push(metadata);
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_setup_handshake() {
        init_tracing();
        let (a, b) = in_process_pair(64);
        let setup = SetupConfig::new()
            .with_mime_types("application/json", "application/json")
            .with_payload(Payload::new("hello-server"));
        let (client, server) = tokio::join!(
            connect(a, RejectingResponder, setup),
            accept(b, EchoResponder::default(), AcceptConfig::new()),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert!(client.peer_setup().is_none());
        let info = server.peer_setup().unwrap();
        assert_eq!(info.version, Version::CURRENT);
        assert_eq!(info.data_mime_type, "application/json");
        assert_eq!(info.payload.data().as_ref(), b"hello-server");
    }

    #[tokio::test]
    async fn test_fire_and_forget_reaches_responder() {
        init_tracing();
        let responder = RecordingResponder::new();
        let seen = responder.fnf.clone();
        let (client, _server) = connected_pair(responder).await;

        client
            .requester()
            .fire_and_forget(Payload::new("one-shot"))
            .unwrap();

        eventually(|| seen.lock().iter().any(|d| d.as_ref() == b"one-shot")).await;
    }

    #[tokio::test]
    async fn test_metadata_push_reaches_responder() {
        init_tracing();
        let responder = RecordingResponder::new();
        let seen = responder.pushes.clone();
        let (client, _server) = connected_pair(responder).await;

        client
            .requester()
            .metadata_push(Bytes::from_static(b"routing-update"))
            .unwrap();

        eventually(|| seen.lock().iter().any(|m| m.as_ref() == b"routing-update")).await;
    }

    #[tokio::test]
    async fn test_version_mismatch_is_hard_rejection() {
        init_tracing();
        let (a, b) = in_process_pair(64);

        let bad_setup = Frame::Setup {
            version: Version::new(2, 0),
            honor_lease: false,
            keep_alive_interval_ms: 1000,
            max_lifetime_ms: 5000,
            resume_token: None,
            metadata_mime_type: String::new(),
            data_mime_type: String::new(),
            payload: Payload::empty(),
        };
        a.send(bad_setup.encode().unwrap()).await.unwrap();

        let result = accept(b, RejectingResponder, AcceptConfig::new()).await;
        assert!(matches!(
            result,
            Err(ConnectionError::UnsupportedVersion { .. })
        ));

        // The peer is told why before the transport closes.
        let frame = Frame::decode(a.receive().await.unwrap()).unwrap();
        assert!(matches!(
            frame,
            Frame::Error { stream_id: 0, code, .. } if code == ErrorCode::INVALID_SETUP
        ));
    }

    #[tokio::test]
    async fn test_non_setup_first_frame_rejected() {
        init_tracing();
        let (a, b) = in_process_pair(64);
        a.send(Frame::Cancel { stream_id: 1 }.encode().unwrap())
            .await
            .unwrap();
        let result = accept(b, RejectingResponder, AcceptConfig::new()).await;
        assert!(matches!(result, Err(ConnectionError::SetupRejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_fails_connection_and_streams() {
        init_tracing();
        let (a, _b) = in_process_pair(64);
        let setup = SetupConfig::new().with_keep_alive(KeepAlive::new(
            Duration::from_millis(50),
            Duration::from_millis(200),
        ));
        // The peer never answers: no accept side at all.
        let client = connect(a, RejectingResponder, setup).await.unwrap();

        let requester = client.requester();
        let pending = tokio::spawn(async move {
            requester.request_response(Payload::new("never-answered")).await
        });

        let error = client.closed().await;
        assert!(matches!(&*error, ConnectionError::KeepAliveTimeout(_)));
        assert!(matches!(
            pending.await.unwrap(),
            Err(StreamError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_keepalive_respond_echoes_data() {
        init_tracing();
        let (a, b) = in_process_pair(64);
        let _client = connect(a, RejectingResponder, SetupConfig::new())
            .await
            .unwrap();

        // Manual server: swallow the setup frame, then demand a keepalive
        // response.
        let setup = Frame::decode(b.receive().await.unwrap()).unwrap();
        assert!(matches!(setup, Frame::Setup { .. }));

        b.send(
            Frame::KeepAlive {
                respond: true,
                last_received_position: 0,
                data: Bytes::from_static(b"ping"),
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

        loop {
            let frame = Frame::decode(b.receive().await.unwrap()).unwrap();
            if let Frame::KeepAlive { respond, data, .. } = frame {
                if !respond {
                    assert_eq!(data.as_ref(), b"ping");
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_peer_connection_error_fails_all_outstanding_calls() {
        init_tracing();
        let (a, b) = in_process_pair(64);
        let client = connect(a, RejectingResponder, SetupConfig::new())
            .await
            .unwrap();
        let _setup = b.receive().await.unwrap();

        let requester = client.requester();
        let pending = tokio::spawn(async move {
            requester.request_response(Payload::new("in-flight")).await
        });
        // Let the request frame reach the manual server.
        let _request = b.receive().await.unwrap();

        b.send(
            Frame::Error {
                stream_id: 0,
                code: ErrorCode::CONNECTION_ERROR,
                message: "go away".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

        let error = client.closed().await;
        assert!(
            matches!(&*error, ConnectionError::PeerError { code, message }
                if *code == ErrorCode::CONNECTION_ERROR && message == "go away")
        );
        assert!(matches!(
            pending.await.unwrap(),
            Err(StreamError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        init_tracing();
        let (client, server) = connected_pair(EchoResponder::default()).await;
        client.close();

        let error = server.closed().await;
        assert!(matches!(&*error, ConnectionError::PeerError { code, .. }
            if *code == ErrorCode::CONNECTION_CLOSE));

        // Local sends fail synchronously once closed.
        assert!(client
            .requester()
            .fire_and_forget(Payload::new("late"))
            .is_err());
    }
}
