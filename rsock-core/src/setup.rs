//! Setup handshake configuration and decoded peer setup.

use crate::keepalive::KeepAlive;
use bytes::Bytes;
use rsock_protocol::{Frame, Payload, Version};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Connection setup parameters sent by the initiating side.
#[derive(Debug, Clone)]
pub struct SetupConfig {
    pub keep_alive: KeepAlive,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub honor_lease: bool,
    pub resume_token: Option<Bytes>,
    payload: Payload,
}

impl SetupConfig {
    pub fn new() -> Self {
        Self {
            keep_alive: KeepAlive::default(),
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            honor_lease: false,
            resume_token: None,
            payload: Payload::empty(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_mime_types(
        mut self,
        metadata: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        self.metadata_mime_type = metadata.into();
        self.data_mime_type = data.into();
        self
    }

    /// Sets the opaque setup payload (e.g. credentials in the metadata).
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_resume_token(mut self, token: Bytes) -> Self {
        self.resume_token = Some(token);
        self
    }

    pub fn with_lease(mut self) -> Self {
        self.honor_lease = true;
        self
    }

    pub(crate) fn into_frame(self) -> Frame {
        Frame::Setup {
            version: Version::CURRENT,
            honor_lease: self.honor_lease,
            keep_alive_interval_ms: self.keep_alive.interval_millis(),
            max_lifetime_ms: self.keep_alive.max_lifetime_millis(),
            resume_token: self.resume_token,
            metadata_mime_type: self.metadata_mime_type,
            data_mime_type: self.data_mime_type,
            payload: self.payload,
        }
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The peer's setup parameters, as decoded by the accepting side.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    pub version: Version,
    pub keep_alive: KeepAlive,
    pub honor_lease: bool,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub resume_token: Option<Bytes>,
    pub payload: Payload,
}

impl SetupInfo {
    /// Extracts setup info from a decoded frame; `None` if it is not a
    /// Setup frame.
    pub(crate) fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Setup {
                version,
                honor_lease,
                keep_alive_interval_ms,
                max_lifetime_ms,
                resume_token,
                metadata_mime_type,
                data_mime_type,
                payload,
            } => Some(Self {
                version,
                keep_alive: KeepAlive::from_millis(keep_alive_interval_ms, max_lifetime_ms),
                honor_lease,
                metadata_mime_type,
                data_mime_type,
                resume_token,
                payload,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_setup_config_frame_roundtrip() {
        let config = SetupConfig::new()
            .with_keep_alive(KeepAlive::new(
                Duration::from_secs(5),
                Duration::from_secs(30),
            ))
            .with_mime_types("application/json", "application/json")
            .with_resume_token(Bytes::from_static(b"tok"))
            .with_payload(Payload::new("hello"));

        let keep_alive = config.keep_alive;
        let frame = config.into_frame();
        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        let info = SetupInfo::from_frame(decoded).unwrap();

        assert_eq!(info.version, Version::CURRENT);
        assert_eq!(info.keep_alive, keep_alive);
        assert_eq!(info.data_mime_type, "application/json");
        assert_eq!(info.resume_token.as_deref(), Some(&b"tok"[..]));
        assert_eq!(info.payload.data().as_ref(), b"hello");
        assert!(!info.honor_lease);
    }

    #[test]
    fn test_from_frame_rejects_other_kinds() {
        assert!(SetupInfo::from_frame(Frame::Cancel { stream_id: 1 }).is_none());
    }
}
