//! # rsock-protocol
//!
//! Wire format implementation for the RSocket protocol.
//!
//! This crate provides:
//! - The binary frame format: a 31-bit stream id, a 6-bit frame type and
//!   10 type-specific flag bits, followed by a type-specific body
//! - Encoding and decoding of every frame kind, with no protocol state
//! - Length-prefix reassembly for byte-stream transports
//! - The [`Payload`] data unit (data + optional metadata) and its
//!   ownership rules
//! - Wire error codes and the malformed-frame error taxonomy

pub mod codec;
pub mod error;
pub mod frame;
pub mod payload;

pub use codec::LengthDecoder;
pub use error::{ErrorCode, FrameError};
pub use frame::{Frame, FrameType, Version};
pub use payload::Payload;

/// Size of the fixed frame header in bytes (4-byte stream id + 2 bytes of
/// type and flags).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the length prefix used by byte-stream transports.
pub const LENGTH_PREFIX_SIZE: usize = 3;

/// Maximum encoded frame size (16 MiB), enforced on encode and decode.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest valid stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;
