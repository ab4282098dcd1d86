//! TCP transport with 3-byte length-prefix framing.

use bytes::{Bytes, BytesMut};
use rsock_core::{Transport, TransportError};
use rsock_protocol::codec::{write_length_prefixed, LengthDecoder};
use rsock_protocol::{FrameError, LENGTH_PREFIX_SIZE};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

/// Default timeout for establishing the TCP connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A duplex frame channel over one TCP connection.
///
/// Frames cross the socket prefixed with a 3-byte big-endian length; the
/// read side reassembles them with the protocol [`LengthDecoder`]. The two
/// halves live behind async mutexes, so sends and receives from different
/// tasks interleave safely. Receives are cancel-safe: partially read bytes
/// stay in the decoder buffer and the next receive picks them up.
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<ReadState>,
    closed_tx: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
}

struct ReadState {
    half: OwnedReadHalf,
    decoder: LengthDecoder,
}

impl TcpTransport {
    /// Connects to a listening peer with the default timeout.
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::connect_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connects to a listening peer, failing after `timeout`.
    pub async fn connect_timeout(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        tracing::debug!("connecting to {addr}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ))
            })??;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-established stream (e.g. an accepted connection).
    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        Self {
            writer: Mutex::new(write_half),
            reader: Mutex::new(ReadState {
                half: read_half,
                decoder: LengthDecoder::new(),
            }),
            closed_tx,
            peer_addr,
        }
    }

    /// The peer's address, if the socket could report it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// An oversize or malformed length prefix means the two sides no longer
/// agree on framing; the stream is unusable.
fn framing_error(error: FrameError) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        error.to_string(),
    ))
}

impl Transport for TcpTransport {
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let mut wire = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
            write_length_prefixed(&mut wire, &frame).map_err(framing_error)?;
            let mut writer = self.writer.lock().await;
            writer.write_all(&wire).await?;
            Ok(())
        }
    }

    fn receive(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send {
        async move {
            let mut closed = self.closed_tx.subscribe();
            if *closed.borrow_and_update() {
                return Err(TransportError::Closed);
            }
            let mut state = self.reader.lock().await;
            loop {
                if let Some(frame) = state.decoder.next_frame().map_err(framing_error)? {
                    return Ok(frame);
                }
                let ReadState { half, decoder } = &mut *state;
                tokio::select! {
                    read = half.read_buf(decoder.buffer_mut()) => {
                        if read? == 0 {
                            return Err(TransportError::Closed);
                        }
                    }
                    changed = closed.changed() => {
                        let _ = changed;
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.closed_tx.send(true);
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

/// Accepts TCP connections and wraps each in a [`TcpTransport`].
pub struct TcpServerTransport {
    listener: TcpListener,
}

impl TcpServerTransport {
    /// Binds to `addr` (port 0 picks a free one).
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> Result<(TcpTransport, SocketAddr), TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::debug!("accepted connection from {addr}");
        Ok((TcpTransport::from_stream(stream), addr))
    }
}
