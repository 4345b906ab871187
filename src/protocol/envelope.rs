use thiserror::Error;

use super::compress::Compression;
use super::queue::Priority;

/// Wire format version written in every frame header.
pub const PROTOCOL_VERSION: u8 = 5;

/// version(1) + type(1) + compression(1) + reserved(1) + ts(8) + len(4).
pub const HEADER_LEN: usize = 16;

/// Kind of payload carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Metrics = 1,
    PolicyEvents = 2,
    ThrottledPolicyEvents = 3,
    CompResults = 4,
    AuditTap = 5,
    SessionData = 6,
}

impl MessageType {
    pub const ALL: [Self; 6] = [
        Self::Metrics,
        Self::PolicyEvents,
        Self::ThrottledPolicyEvents,
        Self::CompResults,
        Self::AuditTap,
        Self::SessionData,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == v)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::PolicyEvents => "policy_events",
            Self::ThrottledPolicyEvents => "throttled_policy_events",
            Self::CompResults => "comp_results",
            Self::AuditTap => "audit_tap",
            Self::SessionData => "session_data",
        }
    }

    /// Queue priority producers use for this message type.
    pub const fn default_priority(self) -> Priority {
        match self {
            Self::SessionData => Priority::High,
            Self::Metrics | Self::PolicyEvents | Self::AuditTap => Priority::Medium,
            Self::ThrottledPolicyEvents | Self::CompResults => Priority::Low,
        }
    }

    /// Types compressed regardless of the encoder setting.
    pub const fn always_compressed(self) -> bool {
        matches!(self, Self::AuditTap)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("frame truncated: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown compression {0}")]
    UnknownCompression(u8),

    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
}

/// One encoded message ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message_type: MessageType,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub compression: Compression,
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Serializes header and payload into a big-endian wire frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| EnvelopeError::PayloadTooLarge(self.payload.len()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(self.message_type as u8);
        out.push(self.compression as u8);
        out.push(0);
        out.extend_from_slice(&self.timestamp_ns.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses one frame. Trailing bytes after the payload are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated {
                needed: HEADER_LEN,
                got: data.len(),
            });
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(data[0]));
        }
        let message_type =
            MessageType::from_u8(data[1]).ok_or(EnvelopeError::UnknownMessageType(data[1]))?;
        let compression =
            Compression::from_u8(data[2]).ok_or(EnvelopeError::UnknownCompression(data[2]))?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[4..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[12..16]);
        let len = u32::from_be_bytes(len) as usize;

        let needed = HEADER_LEN + len;
        if data.len() < needed {
            return Err(EnvelopeError::Truncated {
                needed,
                got: data.len(),
            });
        }

        Ok(Self {
            message_type,
            timestamp_ns: u64::from_be_bytes(ts),
            compression,
            payload: data[HEADER_LEN..needed].to_vec(),
        })
    }
}
