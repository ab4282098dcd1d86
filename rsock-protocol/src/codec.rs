//! Length-prefix framing for byte-stream transports.
//!
//! Message-oriented transports deliver whole frame bodies and do not need
//! this module. Byte-stream transports (TCP) prefix every frame with a
//! 3-byte big-endian length and use [`LengthDecoder`] to reassemble frames
//! from the read side.

use crate::error::FrameError;
use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Writes a frame body with its 3-byte length prefix.
pub fn write_length_prefixed(buf: &mut BytesMut, frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    buf.reserve(LENGTH_PREFIX_SIZE + frame.len());
    buf.put_uint(frame.len() as u64, LENGTH_PREFIX_SIZE);
    buf.put_slice(frame);
    Ok(())
}

/// Reassembles length-prefixed frames from a byte stream.
pub struct LengthDecoder {
    buffer: BytesMut,
}

impl LengthDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends raw bytes from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Exposes the internal buffer so reads can land directly in it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to extract the next complete frame body.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let frame_len =
            u32::from_be_bytes([0, self.buffer[0], self.buffer[1], self.buffer[2]]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + frame_len {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(frame_len).freeze()))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LengthDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn test_length_prefixed_roundtrip() {
        let frame = Frame::Cancel { stream_id: 1 }.encode().unwrap();
        let mut wire = BytesMut::new();
        write_length_prefixed(&mut wire, &frame).unwrap();

        let mut decoder = LengthDecoder::new();
        decoder.extend(&wire);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(body, frame);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_feed() {
        let frame = Frame::RequestN {
            stream_id: 3,
            request_n: 10,
        }
        .encode()
        .unwrap();
        let mut wire = BytesMut::new();
        write_length_prefixed(&mut wire, &frame).unwrap();

        let mut decoder = LengthDecoder::new();
        decoder.extend(&wire[..2]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&wire[2..wire.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&wire[wire.len() - 1..]);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Frame::decode(body).unwrap(), Frame::RequestN {
            stream_id: 3,
            request_n: 10,
        });
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let first = Frame::Cancel { stream_id: 1 }.encode().unwrap();
        let second = Frame::Cancel { stream_id: 3 }.encode().unwrap();
        let mut wire = BytesMut::new();
        write_length_prefixed(&mut wire, &first).unwrap();
        write_length_prefixed(&mut wire, &second).unwrap();

        let mut decoder = LengthDecoder::new();
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), first);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), second);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut decoder = LengthDecoder::new();
        decoder.extend(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_frame_body() {
        // A zero-length body is framed and recovered without stalling.
        let mut wire = BytesMut::new();
        write_length_prefixed(&mut wire, &[]).unwrap();
        let mut decoder = LengthDecoder::new();
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap().len(), 0);
    }
}
