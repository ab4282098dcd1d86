//! Binary frame format.
//!
//! Frame layout (6-byte header + type-specific body):
//!
//! ```text
//! +-----------------------------+----------------+----------------+
//! | 0 | stream id               | frame type     | flags          |
//! | 1 |       31 bits           |    6 bits      |    10 bits     |
//! +-----------------------------+----------------+----------------+
//! | body (type specific)                                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! All multi-byte integers are big-endian. Variable-length fields carry
//! explicit length prefixes: 1 byte for mime types, 2 bytes for resume
//! tokens, 3 bytes for metadata when a data section follows it. Metadata
//! without a following data section (MetadataPush, Lease) and all data
//! sections consume the frame remainder.

use crate::error::{ErrorCode, FrameError};
use crate::payload::Payload;
use crate::{MAX_FRAME_SIZE, MAX_STREAM_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame type codes (6 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    KeepAlive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl FrameType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::Setup,
            0x02 => Self::Lease,
            0x03 => Self::KeepAlive,
            0x04 => Self::RequestResponse,
            0x05 => Self::RequestFnf,
            0x06 => Self::RequestStream,
            0x07 => Self::RequestChannel,
            0x08 => Self::RequestN,
            0x09 => Self::Cancel,
            0x0A => Self::Payload,
            0x0B => Self::Error,
            0x0C => Self::MetadataPush,
            0x0D => Self::Resume,
            0x0E => Self::ResumeOk,
            0x3F => Self::Ext,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Frame flag bits (10 bits below the frame type).
pub mod flags {
    /// Receiver may skip a frame of unknown type instead of erroring.
    pub const IGNORE: u16 = 0x200;
    /// A metadata section is present.
    pub const METADATA: u16 = 0x100;
    /// Fragmented frame, more fragments follow (request and payload frames).
    pub const FOLLOWS: u16 = 0x080;
    /// Resume token present (Setup frames).
    pub const RESUME_ENABLE: u16 = 0x080;
    /// Receiver must answer with a keepalive (KeepAlive frames).
    pub const RESPOND: u16 = 0x080;
    /// Stream half is complete (RequestChannel and Payload frames).
    pub const COMPLETE: u16 = 0x040;
    /// Requester honors lease semantics (Setup frames).
    pub const LEASE: u16 = 0x040;
    /// A payload item is present (Payload frames).
    pub const NEXT: u16 = 0x020;
}

/// Protocol version (major.minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// The protocol version implemented by this crate.
    pub const CURRENT: Version = Version { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A decoded frame.
///
/// Frames own the payload buffers they reference until the frame is
/// dropped or the payload is moved out.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Setup {
        version: Version,
        honor_lease: bool,
        keep_alive_interval_ms: u32,
        max_lifetime_ms: u32,
        resume_token: Option<Bytes>,
        metadata_mime_type: String,
        data_mime_type: String,
        payload: Payload,
    },
    Lease {
        ttl_ms: u32,
        number_of_requests: u32,
        metadata: Option<Bytes>,
    },
    KeepAlive {
        respond: bool,
        last_received_position: u64,
        data: Bytes,
    },
    RequestResponse {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestFnf {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestStream {
        stream_id: u32,
        follows: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestChannel {
        stream_id: u32,
        follows: bool,
        complete: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestN {
        stream_id: u32,
        request_n: u32,
    },
    Cancel {
        stream_id: u32,
    },
    Payload {
        stream_id: u32,
        follows: bool,
        complete: bool,
        next: bool,
        /// Only on the wire when `next` is set; empty otherwise.
        payload: Payload,
    },
    Error {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },
    MetadataPush {
        metadata: Bytes,
    },
    Resume {
        version: Version,
        resume_token: Bytes,
        last_received_position: u64,
        first_available_position: u64,
    },
    ResumeOk {
        last_received_position: u64,
    },
    Ext {
        stream_id: u32,
        extended_type: u32,
        payload: Payload,
    },
    /// An unknown frame type with the IGNORE bit set; skipped on receipt.
    Ignore,
}

impl Frame {
    /// Returns the stream id (0 for connection-level frames).
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::RequestResponse { stream_id, .. }
            | Frame::RequestFnf { stream_id, .. }
            | Frame::RequestStream { stream_id, .. }
            | Frame::RequestChannel { stream_id, .. }
            | Frame::RequestN { stream_id, .. }
            | Frame::Cancel { stream_id }
            | Frame::Payload { stream_id, .. }
            | Frame::Error { stream_id, .. }
            | Frame::Ext { stream_id, .. } => *stream_id,
            _ => 0,
        }
    }

    /// Returns the frame type, or `None` for ignored unknown frames.
    pub fn frame_type(&self) -> Option<FrameType> {
        Some(match self {
            Frame::Setup { .. } => FrameType::Setup,
            Frame::Lease { .. } => FrameType::Lease,
            Frame::KeepAlive { .. } => FrameType::KeepAlive,
            Frame::RequestResponse { .. } => FrameType::RequestResponse,
            Frame::RequestFnf { .. } => FrameType::RequestFnf,
            Frame::RequestStream { .. } => FrameType::RequestStream,
            Frame::RequestChannel { .. } => FrameType::RequestChannel,
            Frame::RequestN { .. } => FrameType::RequestN,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::Payload { .. } => FrameType::Payload,
            Frame::Error { .. } => FrameType::Error,
            Frame::MetadataPush { .. } => FrameType::MetadataPush,
            Frame::Resume { .. } => FrameType::Resume,
            Frame::ResumeOk { .. } => FrameType::ResumeOk,
            Frame::Ext { .. } => FrameType::Ext,
            Frame::Ignore => return None,
        })
    }

    /// Encodes the frame into its wire representation (no length prefix).
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let frame_type = self.frame_type().ok_or(FrameError::NotEncodable)?;
        let stream_id = self.stream_id();
        validate_stream_id(frame_type, stream_id)?;

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(stream_id & MAX_STREAM_ID);
        buf.put_u16(u16::from(frame_type.code()) << 10 | self.header_flags());

        match self {
            Frame::Setup {
                version,
                keep_alive_interval_ms,
                max_lifetime_ms,
                resume_token,
                metadata_mime_type,
                data_mime_type,
                payload,
                ..
            } => {
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u32(*keep_alive_interval_ms);
                buf.put_u32(*max_lifetime_ms);
                if let Some(token) = resume_token {
                    write_resume_token(&mut buf, token)?;
                }
                write_mime_type(&mut buf, metadata_mime_type)?;
                write_mime_type(&mut buf, data_mime_type)?;
                write_payload(&mut buf, payload);
            }
            Frame::Lease {
                ttl_ms,
                number_of_requests,
                metadata,
            } => {
                buf.put_u32(*ttl_ms);
                buf.put_u32(*number_of_requests);
                if let Some(metadata) = metadata {
                    buf.put_slice(metadata);
                }
            }
            Frame::KeepAlive {
                last_received_position,
                data,
                ..
            } => {
                buf.put_u64(*last_received_position);
                buf.put_slice(data);
            }
            Frame::RequestResponse { payload, .. } | Frame::RequestFnf { payload, .. } => {
                write_payload(&mut buf, payload);
            }
            Frame::RequestStream {
                initial_request_n,
                payload,
                ..
            }
            | Frame::RequestChannel {
                initial_request_n,
                payload,
                ..
            } => {
                if *initial_request_n == 0 {
                    return Err(FrameError::ZeroRequestN);
                }
                buf.put_u32(*initial_request_n);
                write_payload(&mut buf, payload);
            }
            Frame::RequestN { request_n, .. } => {
                if *request_n == 0 {
                    return Err(FrameError::ZeroRequestN);
                }
                buf.put_u32(*request_n);
            }
            Frame::Cancel { .. } => {}
            Frame::Payload { next, payload, .. } => {
                if *next {
                    write_payload(&mut buf, payload);
                }
            }
            Frame::Error { code, message, .. } => {
                buf.put_u32(code.value());
                buf.put_slice(message.as_bytes());
            }
            Frame::MetadataPush { metadata } => {
                buf.put_slice(metadata);
            }
            Frame::Resume {
                version,
                resume_token,
                last_received_position,
                first_available_position,
            } => {
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                write_resume_token(&mut buf, resume_token)?;
                buf.put_u64(*last_received_position);
                buf.put_u64(*first_available_position);
            }
            Frame::ResumeOk {
                last_received_position,
            } => {
                buf.put_u64(*last_received_position);
            }
            Frame::Ext {
                extended_type,
                payload,
                ..
            } => {
                buf.put_u32(*extended_type);
                write_payload(&mut buf, payload);
            }
            Frame::Ignore => unreachable!(),
        }

        if buf.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(buf.freeze())
    }

    /// Decodes a single frame body (no length prefix).
    pub fn decode(mut body: Bytes) -> Result<Frame, FrameError> {
        need(&body, crate::FRAME_HEADER_SIZE)?;
        let stream_id = body.get_u32() & MAX_STREAM_ID;
        let type_and_flags = body.get_u16();
        let code = (type_and_flags >> 10) as u8;
        let frame_flags = type_and_flags & 0x03FF;

        let frame_type = match FrameType::from_code(code) {
            Some(ft) => ft,
            None if frame_flags & flags::IGNORE != 0 => return Ok(Frame::Ignore),
            None => return Err(FrameError::UnknownType { code }),
        };
        validate_stream_id(frame_type, stream_id)?;

        let has_metadata = frame_flags & flags::METADATA != 0;
        let frame = match frame_type {
            FrameType::Setup => {
                need(&body, 12)?;
                let version = Version::new(body.get_u16(), body.get_u16());
                let keep_alive_interval_ms = body.get_u32();
                let max_lifetime_ms = body.get_u32();
                let resume_token = if frame_flags & flags::RESUME_ENABLE != 0 {
                    Some(read_resume_token(&mut body)?)
                } else {
                    None
                };
                let metadata_mime_type = read_mime_type(&mut body)?;
                let data_mime_type = read_mime_type(&mut body)?;
                let payload = read_payload(&mut body, has_metadata)?;
                Frame::Setup {
                    version,
                    honor_lease: frame_flags & flags::LEASE != 0,
                    keep_alive_interval_ms,
                    max_lifetime_ms,
                    resume_token,
                    metadata_mime_type,
                    data_mime_type,
                    payload,
                }
            }
            FrameType::Lease => {
                need(&body, 8)?;
                let ttl_ms = body.get_u32();
                let number_of_requests = body.get_u32();
                let metadata = has_metadata.then(|| body.split_to(body.len()));
                Frame::Lease {
                    ttl_ms,
                    number_of_requests,
                    metadata,
                }
            }
            FrameType::KeepAlive => {
                need(&body, 8)?;
                Frame::KeepAlive {
                    respond: frame_flags & flags::RESPOND != 0,
                    last_received_position: body.get_u64(),
                    data: body.split_to(body.len()),
                }
            }
            FrameType::RequestResponse => Frame::RequestResponse {
                stream_id,
                follows: frame_flags & flags::FOLLOWS != 0,
                payload: read_payload(&mut body, has_metadata)?,
            },
            FrameType::RequestFnf => Frame::RequestFnf {
                stream_id,
                follows: frame_flags & flags::FOLLOWS != 0,
                payload: read_payload(&mut body, has_metadata)?,
            },
            FrameType::RequestStream => {
                need(&body, 4)?;
                let initial_request_n = body.get_u32();
                if initial_request_n == 0 {
                    return Err(FrameError::ZeroRequestN);
                }
                Frame::RequestStream {
                    stream_id,
                    follows: frame_flags & flags::FOLLOWS != 0,
                    initial_request_n,
                    payload: read_payload(&mut body, has_metadata)?,
                }
            }
            FrameType::RequestChannel => {
                need(&body, 4)?;
                let initial_request_n = body.get_u32();
                if initial_request_n == 0 {
                    return Err(FrameError::ZeroRequestN);
                }
                Frame::RequestChannel {
                    stream_id,
                    follows: frame_flags & flags::FOLLOWS != 0,
                    complete: frame_flags & flags::COMPLETE != 0,
                    initial_request_n,
                    payload: read_payload(&mut body, has_metadata)?,
                }
            }
            FrameType::RequestN => {
                need(&body, 4)?;
                let request_n = body.get_u32();
                if request_n == 0 {
                    return Err(FrameError::ZeroRequestN);
                }
                Frame::RequestN {
                    stream_id,
                    request_n,
                }
            }
            FrameType::Cancel => Frame::Cancel { stream_id },
            FrameType::Payload => {
                let next = frame_flags & flags::NEXT != 0;
                let payload = if next {
                    read_payload(&mut body, has_metadata)?
                } else {
                    Payload::empty()
                };
                Frame::Payload {
                    stream_id,
                    follows: frame_flags & flags::FOLLOWS != 0,
                    complete: frame_flags & flags::COMPLETE != 0,
                    next,
                    payload,
                }
            }
            FrameType::Error => {
                need(&body, 4)?;
                let code = ErrorCode::new(body.get_u32());
                let message = String::from_utf8(body.split_to(body.len()).to_vec())
                    .map_err(|_| FrameError::InvalidUtf8 {
                        field: "error message",
                    })?;
                Frame::Error {
                    stream_id,
                    code,
                    message,
                }
            }
            FrameType::MetadataPush => Frame::MetadataPush {
                metadata: body.split_to(body.len()),
            },
            FrameType::Resume => {
                need(&body, 4)?;
                let version = Version::new(body.get_u16(), body.get_u16());
                let resume_token = read_resume_token(&mut body)?;
                need(&body, 16)?;
                Frame::Resume {
                    version,
                    resume_token,
                    last_received_position: body.get_u64(),
                    first_available_position: body.get_u64(),
                }
            }
            FrameType::ResumeOk => {
                need(&body, 8)?;
                Frame::ResumeOk {
                    last_received_position: body.get_u64(),
                }
            }
            FrameType::Ext => {
                need(&body, 4)?;
                Frame::Ext {
                    stream_id,
                    extended_type: body.get_u32() & MAX_STREAM_ID,
                    payload: read_payload(&mut body, has_metadata)?,
                }
            }
        };
        Ok(frame)
    }

    fn header_flags(&self) -> u16 {
        let mut bits = 0;
        match self {
            Frame::Setup {
                honor_lease,
                resume_token,
                payload,
                ..
            } => {
                if *honor_lease {
                    bits |= flags::LEASE;
                }
                if resume_token.is_some() {
                    bits |= flags::RESUME_ENABLE;
                }
                if payload.has_metadata() {
                    bits |= flags::METADATA;
                }
            }
            Frame::Lease { metadata, .. } => {
                if metadata.is_some() {
                    bits |= flags::METADATA;
                }
            }
            Frame::KeepAlive { respond, .. } => {
                if *respond {
                    bits |= flags::RESPOND;
                }
            }
            Frame::RequestResponse {
                follows, payload, ..
            }
            | Frame::RequestFnf {
                follows, payload, ..
            }
            | Frame::RequestStream {
                follows, payload, ..
            } => {
                if *follows {
                    bits |= flags::FOLLOWS;
                }
                if payload.has_metadata() {
                    bits |= flags::METADATA;
                }
            }
            Frame::RequestChannel {
                follows,
                complete,
                payload,
                ..
            } => {
                if *follows {
                    bits |= flags::FOLLOWS;
                }
                if *complete {
                    bits |= flags::COMPLETE;
                }
                if payload.has_metadata() {
                    bits |= flags::METADATA;
                }
            }
            Frame::Payload {
                follows,
                complete,
                next,
                payload,
                ..
            } => {
                if *follows {
                    bits |= flags::FOLLOWS;
                }
                if *complete {
                    bits |= flags::COMPLETE;
                }
                if *next {
                    bits |= flags::NEXT;
                    if payload.has_metadata() {
                        bits |= flags::METADATA;
                    }
                }
            }
            Frame::MetadataPush { .. } => {
                bits |= flags::METADATA;
            }
            Frame::Ext { payload, .. } => {
                bits |= flags::IGNORE;
                if payload.has_metadata() {
                    bits |= flags::METADATA;
                }
            }
            _ => {}
        }
        bits
    }

    fn flag_letters(&self) -> String {
        let bits = self.header_flags();
        let mut letters = String::new();
        if bits & flags::METADATA != 0 {
            letters.push('M');
        }
        // The lower bits are type-specific; pick the letter by kind.
        if bits & 0x080 != 0 {
            letters.push(match self {
                Frame::Setup { .. } | Frame::KeepAlive { .. } => 'R',
                _ => 'F',
            });
        }
        if bits & 0x040 != 0 {
            letters.push(match self {
                Frame::Setup { .. } => 'L',
                _ => 'C',
            });
        }
        if bits & flags::NEXT != 0 {
            letters.push('N');
        }
        letters
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_type() {
            Some(frame_type) => {
                write!(f, "{:?}(stream={}", frame_type, self.stream_id())?;
                let letters = self.flag_letters();
                if !letters.is_empty() {
                    write!(f, " {letters}")?;
                }
                write!(f, ")")
            }
            None => write!(f, "Ignored"),
        }
    }
}

fn validate_stream_id(frame_type: FrameType, stream_id: u32) -> Result<(), FrameError> {
    let valid = match frame_type {
        FrameType::Setup
        | FrameType::Lease
        | FrameType::KeepAlive
        | FrameType::MetadataPush
        | FrameType::Resume
        | FrameType::ResumeOk => stream_id == 0,
        FrameType::RequestResponse
        | FrameType::RequestFnf
        | FrameType::RequestStream
        | FrameType::RequestChannel
        | FrameType::RequestN
        | FrameType::Cancel
        | FrameType::Payload => stream_id != 0,
        FrameType::Error | FrameType::Ext => true,
    };
    if valid {
        Ok(())
    } else {
        Err(FrameError::InvalidStreamId {
            frame_type,
            stream_id,
        })
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), FrameError> {
    if buf.remaining() < n {
        return Err(FrameError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn write_payload(buf: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = payload.metadata() {
        buf.put_uint(metadata.len() as u64, 3);
        buf.put_slice(metadata);
    }
    buf.put_slice(payload.data());
}

fn read_payload(body: &mut Bytes, has_metadata: bool) -> Result<Payload, FrameError> {
    let metadata = if has_metadata {
        need(body, 3)?;
        let len = body.get_uint(3) as usize;
        need(body, len)?;
        Some(body.split_to(len))
    } else {
        None
    };
    let data = body.split_to(body.len());
    Ok(Payload::from_parts(metadata, data))
}

fn write_mime_type(buf: &mut BytesMut, mime_type: &str) -> Result<(), FrameError> {
    if mime_type.len() > u8::MAX as usize {
        return Err(FrameError::MimeTypeTooLong);
    }
    buf.put_u8(mime_type.len() as u8);
    buf.put_slice(mime_type.as_bytes());
    Ok(())
}

fn read_mime_type(body: &mut Bytes) -> Result<String, FrameError> {
    need(body, 1)?;
    let len = body.get_u8() as usize;
    need(body, len)?;
    String::from_utf8(body.split_to(len).to_vec())
        .map_err(|_| FrameError::InvalidUtf8 { field: "mime type" })
}

fn write_resume_token(buf: &mut BytesMut, token: &Bytes) -> Result<(), FrameError> {
    if token.len() > u16::MAX as usize {
        return Err(FrameError::ResumeTokenTooLong);
    }
    buf.put_u16(token.len() as u16);
    buf.put_slice(token);
    Ok(())
}

fn read_resume_token(body: &mut Bytes) -> Result<Bytes, FrameError> {
    need(body, 2)?;
    let len = body.get_u16() as usize;
    need(body, len)?;
    Ok(body.split_to(len))
}
