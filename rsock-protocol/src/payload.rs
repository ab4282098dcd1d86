//! Application payloads: a data buffer plus optional metadata.

use bytes::Bytes;

/// The data unit carried by request and payload frames.
///
/// A payload has exactly one logical owner at a time; whoever receives one
/// across an interface boundary owns it. Dropping a payload releases its
/// buffers. [`Payload::close`] releases them early and poisons the value:
/// reading after close is a programming error and panics, and closing twice
/// trips a debug assertion.
///
/// `Clone` is a cheap clone sharing the underlying buffers; use
/// [`Payload::copy`] for an independent deep copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    parts: Option<Parts>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Parts {
    metadata: Option<Bytes>,
    data: Bytes,
}

impl Payload {
    /// Creates a payload with data and no metadata.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::from_parts(None, data.into())
    }

    /// Creates a payload with data and metadata.
    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self::from_parts(Some(metadata.into()), data.into())
    }

    /// Creates an empty payload (no metadata, zero-length data).
    pub fn empty() -> Self {
        Self::from_parts(None, Bytes::new())
    }

    pub fn from_parts(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self {
            parts: Some(Parts { metadata, data }),
        }
    }

    /// Returns the data buffer.
    ///
    /// # Panics
    ///
    /// Panics if the payload was closed.
    pub fn data(&self) -> &Bytes {
        match &self.parts {
            Some(parts) => &parts.data,
            None => panic!("payload read after close"),
        }
    }

    /// Returns the metadata buffer, if present.
    ///
    /// # Panics
    ///
    /// Panics if the payload was closed.
    pub fn metadata(&self) -> Option<&Bytes> {
        match &self.parts {
            Some(parts) => parts.metadata.as_ref(),
            None => panic!("payload read after close"),
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata().is_some()
    }

    /// Releases the payload's buffers.
    ///
    /// Closing an already-closed payload is a caller error and trips a
    /// debug assertion.
    pub fn close(&mut self) {
        debug_assert!(self.parts.is_some(), "payload closed twice");
        self.parts = None;
    }

    pub fn is_closed(&self) -> bool {
        self.parts.is_none()
    }

    /// Returns an independent deep copy with no shared backing storage.
    ///
    /// # Panics
    ///
    /// Panics if the payload was closed.
    pub fn copy(&self) -> Payload {
        let parts = match &self.parts {
            Some(parts) => parts,
            None => panic!("payload copied after close"),
        };
        Self::from_parts(
            parts.metadata.as_ref().map(|m| Bytes::copy_from_slice(m)),
            Bytes::copy_from_slice(&parts.data),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let p = Payload::with_metadata("data", "meta");
        assert_eq!(p.data().as_ref(), b"data");
        assert_eq!(p.metadata().unwrap().as_ref(), b"meta");
        assert!(p.has_metadata());

        let p = Payload::new("data");
        assert!(p.metadata().is_none());
    }

    #[test]
    fn test_payload_close_releases() {
        let mut p = Payload::new("data");
        assert!(!p.is_closed());
        p.close();
        assert!(p.is_closed());
    }

    #[test]
    #[should_panic(expected = "payload read after close")]
    fn test_payload_read_after_close_panics() {
        let mut p = Payload::new("data");
        p.close();
        let _ = p.data();
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_payload_double_close_asserts() {
        let mut p = Payload::new("data");
        p.close();
        p.close();
    }

    #[test]
    fn test_payload_copy_is_independent() {
        let original = Payload::with_metadata("data", "meta");
        let copied = original.copy();
        assert_eq!(original, copied);

        // No shared backing storage.
        assert_ne!(original.data().as_ptr(), copied.data().as_ptr());

        let mut original = original;
        original.close();
        assert_eq!(copied.data().as_ref(), b"data");
    }

    #[test]
    fn test_payload_empty() {
        let p = Payload::empty();
        assert!(p.data().is_empty());
        assert!(!p.has_metadata());
    }
}
