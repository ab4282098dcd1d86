//! Session resumption: buffering, replay and transport splicing.
//!
//! The resumable layer sits between the connection and the transport. Every
//! outbound frame that carries stream data is appended to a position-keyed
//! ledger before it is sent; inbound stream frames advance a receive
//! position. When the transport dies the connection is held in a suspended
//! state (streams stay up, flow windows freeze) for a bounded grace period.
//! A reconnect exchanges Resume/ResumeOk frames carrying both sides'
//! positions, prunes acknowledged ledger entries and replays the rest
//! exactly once onto the new transport.

use crate::connection::{
    first_frame, reject_with, start, validate_setup_version, AcceptConfig, ConnShared, Connection,
};
use crate::error::ConnectionError;
use crate::registry::Side;
use crate::responder::Responder;
use crate::setup::{SetupConfig, SetupInfo};
use crate::transport::{Transport, TransportError};
use bytes::{Buf, Bytes};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rsock_protocol::{ErrorCode, Frame, Version, MAX_STREAM_ID};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Default bound on unacknowledged outbound data (8 MiB).
const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Resumption settings, used by both sides of a connection.
#[derive(Debug, Clone)]
pub struct ResumeConfig {
    /// How long a disconnected session is held before it terminates with
    /// `ResumeTimeout`.
    pub grace_period: Duration,
    /// Bound on buffered unacknowledged bytes; exceeding it while the peer
    /// lags fails the connection instead of dropping frames.
    pub max_buffer_bytes: usize,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

impl ResumeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_buffer_bytes(mut self, max_buffer_bytes: usize) -> Self {
        self.max_buffer_bytes = max_buffer_bytes;
        self
    }
}

/// Generates a random 16-byte resume token.
pub fn generate_token() -> Bytes {
    Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes())
}

/// Reasons a replay position cannot be honored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ResumePositionError {
    #[error("position {requested} no longer available (first available {first_available})")]
    Unavailable { requested: u64, first_available: u64 },

    #[error("position {requested} is ahead of send position {next}")]
    Ahead { requested: u64, next: u64 },
}

/// Ordered log of unacknowledged outbound frames, keyed by byte position.
///
/// Positions are cumulative encoded-frame lengths, strictly increasing.
/// Entries leave the log only when the peer acknowledges a position at or
/// past their end, so no unacknowledged frame is ever lost.
pub(crate) struct ResumeLedger {
    entries: VecDeque<LedgerEntry>,
    first_position: u64,
    next_position: u64,
    buffered_bytes: usize,
}

struct LedgerEntry {
    position: u64,
    frame: Bytes,
}

impl ResumeLedger {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_position: 0,
            next_position: 0,
            buffered_bytes: 0,
        }
    }

    /// Appends a frame; returns the position it was assigned.
    pub fn append(&mut self, frame: Bytes) -> u64 {
        let position = self.next_position;
        self.next_position += frame.len() as u64;
        self.buffered_bytes += frame.len();
        self.entries.push_back(LedgerEntry { position, frame });
        position
    }

    /// Drops every entry fully covered by the acknowledged position.
    pub fn prune_through(&mut self, position: u64) {
        while let Some(front) = self.entries.front() {
            let end = front.position + front.frame.len() as u64;
            if end > position {
                break;
            }
            self.buffered_bytes -= front.frame.len();
            self.first_position = end;
            self.entries.pop_front();
        }
    }

    /// Validates that a replay from `position` is possible.
    pub fn check_position(&self, position: u64) -> Result<(), ResumePositionError> {
        if position < self.first_position {
            return Err(ResumePositionError::Unavailable {
                requested: position,
                first_available: self.first_position,
            });
        }
        if position > self.next_position {
            return Err(ResumePositionError::Ahead {
                requested: position,
                next: self.next_position,
            });
        }
        Ok(())
    }

    /// Frames at or after `position`, in send order.
    pub fn replay_from(&self, position: u64) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter(|entry| entry.position >= position)
            .map(|entry| entry.frame.clone())
            .collect()
    }

    pub fn first_available(&self) -> u64 {
        self.first_position
    }

    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-connection resumption state shared between the resumable transport
/// and the connection's dispatch path.
pub struct ResumeSession {
    token: Bytes,
    ledger: Mutex<ResumeLedger>,
    received: AtomicU64,
    suspended: AtomicBool,
    max_buffer_bytes: usize,
}

impl ResumeSession {
    pub(crate) fn new(token: Bytes, max_buffer_bytes: usize) -> Self {
        Self {
            token,
            ledger: Mutex::new(ResumeLedger::new()),
            received: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            max_buffer_bytes,
        }
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    /// Cumulative bytes of stream frames received from the peer.
    pub fn received_position(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub(crate) fn record_received(&self, frame_len: usize) {
        self.received.fetch_add(frame_len as u64, Ordering::AcqRel);
    }

    /// Prunes the ledger up to a position the peer acknowledged.
    pub(crate) fn acknowledge(&self, position: u64) {
        self.ledger.lock().prune_through(position);
    }

    /// Appends an outbound frame; `false` means the buffer bound was hit.
    pub(crate) fn append(&self, frame: Bytes) -> bool {
        let mut ledger = self.ledger.lock();
        ledger.append(frame);
        ledger.buffered_bytes() <= self.max_buffer_bytes
    }

    pub(crate) fn first_available(&self) -> u64 {
        self.ledger.lock().first_available()
    }

    pub(crate) fn check_replay(&self, position: u64) -> Result<(), ResumePositionError> {
        self.ledger.lock().check_position(position)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }
}

/// Whether encoded frame bytes belong to a stream (and therefore count
/// toward resume positions). Connection-level frames are stream id 0.
fn is_resumable_frame(frame: &Bytes) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let stream_id = (&frame[..4]).get_u32() & MAX_STREAM_ID;
    stream_id != 0
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LinkState {
    Active,
    Suspended,
    Closed,
}

#[derive(Clone, Debug)]
enum CloseReason {
    Timeout,
    Rejected(String),
    Overflow,
    Closed,
}

impl CloseReason {
    fn to_error(&self) -> TransportError {
        match self {
            CloseReason::Timeout => TransportError::ResumeTimeout,
            CloseReason::Rejected(message) => TransportError::ResumeRejected(message.clone()),
            CloseReason::Overflow => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "resume buffer overflow",
            )),
            CloseReason::Closed => TransportError::Closed,
        }
    }
}

struct Link<T: Transport> {
    inner: RwLock<Option<Arc<T>>>,
    state_tx: watch::Sender<LinkState>,
    close_reason: Mutex<Option<CloseReason>>,
    generation: AtomicU64,
}

/// Transport wrapper providing suspension, buffering and replay.
///
/// Implements [`Transport`] itself, so the connection is oblivious to
/// resumption: sends of stream frames are ledgered and survive transport
/// loss, receives block while suspended, and the grace period converts a
/// lost transport into a terminal failure.
pub struct ResumableTransport<T: Transport> {
    session: Arc<ResumeSession>,
    link: Arc<Link<T>>,
    grace_period: Duration,
}

impl<T: Transport> ResumableTransport<T> {
    pub(crate) fn new(transport: T, session: Arc<ResumeSession>, grace_period: Duration) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Active);
        Self {
            session,
            link: Arc::new(Link {
                inner: RwLock::new(Some(Arc::new(transport))),
                state_tx,
                close_reason: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            grace_period,
        }
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.link.close_reason.lock().clone()
    }

    fn current(&self) -> Option<Arc<T>> {
        self.link.inner.read().clone()
    }

    /// Drops the dead transport and starts the grace timer. The session
    /// stays up; streams and flow windows are untouched.
    fn suspend(&self) {
        {
            let mut inner = self.link.inner.write();
            if inner.is_none() {
                return;
            }
            *inner = None;
        }
        if self.close_reason().is_some() {
            return;
        }
        self.session.set_suspended(true);
        let generation = self.link.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.link.state_tx.send(LinkState::Suspended);
        tracing::info!("transport lost; session suspended awaiting resume");

        let link = self.link.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if link.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let mut reason = link.close_reason.lock();
            if reason.is_none() && *link.state_tx.borrow() == LinkState::Suspended {
                tracing::warn!("resume grace period elapsed; terminating session");
                *reason = Some(CloseReason::Timeout);
                drop(reason);
                let _ = link.state_tx.send(LinkState::Closed);
            }
        });
    }

    /// Splices a replacement transport in: replays every ledger entry at or
    /// after the peer's acknowledged position, then reactivates.
    pub(crate) async fn install(
        &self,
        transport: T,
        peer_position: u64,
    ) -> Result<(), ConnectionError> {
        if let Some(reason) = self.close_reason() {
            return Err(ConnectionError::from(reason.to_error()));
        }
        let frames = {
            let mut ledger = self.session.ledger.lock();
            ledger
                .check_position(peer_position)
                .map_err(|e| ConnectionError::ResumeRejected(e.to_string()))?;
            ledger.prune_through(peer_position);
            ledger.replay_from(peer_position)
        };
        tracing::debug!("replaying {} ledger entries after position {peer_position}", frames.len());
        for frame in frames {
            transport.send(frame).await.map_err(ConnectionError::from)?;
        }
        *self.link.inner.write() = Some(Arc::new(transport));
        self.link.generation.fetch_add(1, Ordering::SeqCst);
        self.session.set_suspended(false);
        let _ = self.link.state_tx.send(LinkState::Active);
        Ok(())
    }

    /// Terminates the session because the peer rejected the resume.
    pub(crate) fn close_rejected(&self, message: String) {
        {
            let mut reason = self.link.close_reason.lock();
            if reason.is_none() {
                *reason = Some(CloseReason::Rejected(message));
            }
        }
        let _ = self.link.state_tx.send(LinkState::Closed);
        self.link.inner.write().take();
    }

    fn fail(&self, new_reason: CloseReason) -> TransportError {
        let mut reason = self.link.close_reason.lock();
        if reason.is_none() {
            *reason = Some(new_reason);
        }
        let error = reason.as_ref().unwrap().to_error();
        drop(reason);
        let _ = self.link.state_tx.send(LinkState::Closed);
        error
    }
}

impl<T: Transport> Transport for ResumableTransport<T> {
    fn send(&self, frame: Bytes) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        async move {
            if let Some(reason) = self.close_reason() {
                return Err(reason.to_error());
            }
            let resumable = is_resumable_frame(&frame);
            if resumable && !self.session.append(frame.clone()) {
                tracing::warn!("resume buffer overflow; failing connection");
                return Err(self.fail(CloseReason::Overflow));
            }
            match self.current() {
                Some(transport) => {
                    if let Err(error) = transport.send(frame).await {
                        tracing::debug!("send failed ({error}); suspending");
                        self.suspend();
                    }
                    // Ledgered frames will be replayed; anything else
                    // (keepalives) is droppable while suspended.
                    Ok(())
                }
                None => Ok(()),
            }
        }
    }

    fn receive(&self) -> impl std::future::Future<Output = Result<Bytes, TransportError>> + Send {
        async move {
            loop {
                if let Some(reason) = self.close_reason() {
                    return Err(reason.to_error());
                }
                match self.current() {
                    Some(transport) => {
                        let mut state = self.link.state_tx.subscribe();
                        tokio::select! {
                            received = transport.receive() => match received {
                                Ok(frame) => {
                                    if is_resumable_frame(&frame) {
                                        self.session.record_received(frame.len());
                                    }
                                    return Ok(frame);
                                }
                                Err(error) => {
                                    tracing::debug!("receive failed ({error}); suspending");
                                    self.suspend();
                                }
                            },
                            // The transport was swapped or closed under us;
                            // re-evaluate.
                            _ = state.changed() => {}
                        }
                    }
                    None => {
                        let mut state = self.link.state_tx.subscribe();
                        loop {
                            let current = *state.borrow_and_update();
                            match current {
                                LinkState::Active => break,
                                LinkState::Closed => {
                                    let reason =
                                        self.close_reason().unwrap_or(CloseReason::Closed);
                                    return Err(reason.to_error());
                                }
                                LinkState::Suspended => {
                                    if state.changed().await.is_err() {
                                        return Err(TransportError::Closed);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn close(&self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            {
                let mut reason = self.link.close_reason.lock();
                if reason.is_none() {
                    *reason = Some(CloseReason::Closed);
                }
            }
            let _ = self.link.state_tx.send(LinkState::Closed);
            let transport = self.link.inner.write().take();
            if let Some(transport) = transport {
                transport.close().await;
            }
        }
    }
}

/// Handle for reattaching a resumable client connection to a new transport.
pub struct ResumeHandle<T: Transport> {
    transport: Arc<ResumableTransport<T>>,
    session: Arc<ResumeSession>,
}

impl<T: Transport> ResumeHandle<T> {
    /// The session's resume token.
    pub fn token(&self) -> &Bytes {
        self.session.token()
    }

    /// Runs the resume handshake over a freshly established transport.
    ///
    /// On success the suspended connection picks up where it left off, with
    /// unacknowledged frames replayed exactly once. A rejection terminates
    /// the connection and every stream on it.
    pub async fn reconnect(&self, transport: T) -> Result<(), ConnectionError> {
        let resume = Frame::Resume {
            version: Version::CURRENT,
            resume_token: self.session.token().clone(),
            last_received_position: self.session.received_position(),
            first_available_position: self.session.first_available(),
        };
        transport
            .send(resume.encode()?)
            .await
            .map_err(ConnectionError::from)?;

        let reply = Frame::decode(
            transport
                .receive()
                .await
                .map_err(ConnectionError::from)?,
        )?;
        match reply {
            Frame::ResumeOk {
                last_received_position,
            } => {
                self.transport
                    .install(transport, last_received_position)
                    .await?;
                tracing::info!("session resumed");
                Ok(())
            }
            Frame::Error { message, .. } => {
                self.transport.close_rejected(message.clone());
                Err(ConnectionError::ResumeRejected(message))
            }
            other => Err(ConnectionError::ResumeRejected(format!(
                "unexpected frame {other}"
            ))),
        }
    }
}

/// Establishes a resumable connection as the initiating side.
///
/// The setup's resume token is used if present, otherwise a random one is
/// generated. Returns the connection plus the handle used to reattach after
/// transport loss.
pub async fn connect_resumable<T, R>(
    transport: T,
    responder: R,
    setup: SetupConfig,
    resume: ResumeConfig,
) -> Result<(Connection, ResumeHandle<T>), ConnectionError>
where
    T: Transport,
    R: Responder,
{
    let mut setup = setup;
    let token = match &setup.resume_token {
        Some(token) => token.clone(),
        None => {
            let token = generate_token();
            setup = setup.with_resume_token(token.clone());
            token
        }
    };

    let session = Arc::new(ResumeSession::new(token, resume.max_buffer_bytes));
    let resumable = Arc::new(ResumableTransport::new(
        transport,
        session.clone(),
        resume.grace_period,
    ));
    let keep_alive = setup.keep_alive;
    let shared = start(
        resumable.clone(),
        Arc::new(responder),
        Side::Client,
        keep_alive,
        Some(session.clone()),
        Some(setup.into_frame()),
    );
    Ok((
        Connection::new(shared, None),
        ResumeHandle {
            transport: resumable,
            session,
        },
    ))
}

/// Result of accepting a transport on a resumption-enabled server.
pub enum ServerAccept {
    /// A fresh connection was established.
    Connection(Connection),
    /// The transport was spliced into an existing suspended session.
    Resumed,
}

#[derive(Clone)]
struct StoredSession<T: Transport> {
    transport: Arc<ResumableTransport<T>>,
    session: Arc<ResumeSession>,
}

/// Suspended and active resumable sessions, keyed by resume token.
pub struct ResumeStore<T: Transport> {
    sessions: DashMap<Bytes, StoredSession<T>>,
}

impl<T: Transport> ResumeStore<T> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    fn register(&self, token: Bytes, stored: StoredSession<T>) {
        self.sessions.insert(token, stored);
    }

    fn lookup(&self, token: &Bytes) -> Option<StoredSession<T>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    fn unregister(&self, token: &Bytes) {
        self.sessions.remove(token);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<T: Transport> Default for ResumeStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts a transport on a resumption-enabled server.
///
/// A Setup frame with a resume token establishes a fresh resumable
/// connection registered in `store`; a Resume frame splices the transport
/// into the matching suspended session, or is rejected with
/// REJECTED_RESUME when the token is unknown or the positions cannot be
/// reconciled.
pub async fn accept_resumable<T, R>(
    transport: T,
    responder: R,
    config: AcceptConfig,
    store: Arc<ResumeStore<T>>,
    resume: ResumeConfig,
) -> Result<ServerAccept, ConnectionError>
where
    T: Transport,
    R: Responder,
{
    let frame = first_frame(&transport, config.setup_timeout).await?;
    match frame {
        Frame::Setup { .. } => {
            let info = SetupInfo::from_frame(frame).expect("matched setup frame");
            validate_setup_version(&transport, &info).await?;
            let keep_alive = info.keep_alive;

            let Some(token) = info.resume_token.clone() else {
                // Plain connection; no resumption state to keep.
                let shared = start(
                    Arc::new(transport),
                    Arc::new(responder),
                    Side::Server,
                    keep_alive,
                    None,
                    None,
                );
                return Ok(ServerAccept::Connection(Connection::new(
                    shared,
                    Some(info),
                )));
            };

            let session = Arc::new(ResumeSession::new(token.clone(), resume.max_buffer_bytes));
            let resumable = Arc::new(ResumableTransport::new(
                transport,
                session.clone(),
                resume.grace_period,
            ));
            store.register(
                token.clone(),
                StoredSession {
                    transport: resumable.clone(),
                    session: session.clone(),
                },
            );
            let shared = start(
                resumable,
                Arc::new(responder),
                Side::Server,
                keep_alive,
                Some(session),
                None,
            );
            spawn_store_cleanup(shared.clone(), store, token);
            Ok(ServerAccept::Connection(Connection::new(
                shared,
                Some(info),
            )))
        }
        Frame::Resume {
            version,
            resume_token,
            last_received_position,
            first_available_position,
        } => {
            if version != Version::CURRENT {
                let message = format!("unsupported protocol version {version}");
                reject_with(&transport, ErrorCode::REJECTED_RESUME, &message).await;
                return Err(ConnectionError::UnsupportedVersion {
                    expected: Version::CURRENT,
                    actual: version,
                });
            }
            let Some(stored) = store.lookup(&resume_token) else {
                let message = "unknown resume token";
                reject_with(&transport, ErrorCode::REJECTED_RESUME, message).await;
                return Err(ConnectionError::ResumeRejected(message.to_string()));
            };

            // The peer must still hold everything we have not received, and
            // their claimed receive position must fall inside our ledger.
            let reconcilable = first_available_position <= stored.session.received_position()
                && stored.session.check_replay(last_received_position).is_ok();
            if !reconcilable {
                let message = "resume positions cannot be reconciled";
                reject_with(&transport, ErrorCode::REJECTED_RESUME, message).await;
                stored.transport.close_rejected(message.to_string());
                store.unregister(&resume_token);
                return Err(ConnectionError::ResumeRejected(message.to_string()));
            }

            let ok = Frame::ResumeOk {
                last_received_position: stored.session.received_position(),
            };
            transport
                .send(ok.encode()?)
                .await
                .map_err(ConnectionError::from)?;
            stored
                .transport
                .install(transport, last_received_position)
                .await?;
            tracing::info!("session resumed onto new transport");
            Ok(ServerAccept::Resumed)
        }
        other => {
            let message = format!("expected setup or resume frame, got {other}");
            reject_with(&transport, ErrorCode::INVALID_SETUP, &message).await;
            Err(ConnectionError::SetupRejected {
                code: ErrorCode::INVALID_SETUP,
                message,
            })
        }
    }
}

fn spawn_store_cleanup<T: Transport>(
    shared: Arc<ConnShared>,
    store: Arc<ResumeStore<T>>,
    token: Bytes,
) {
    tokio::spawn(async move {
        shared.wait_closed().await;
        store.unregister(&token);
    });
}
