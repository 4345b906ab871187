use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tracing::error;

use super::buffer::BoundedBuffer;
use super::compress::{compress, Compression};
use super::envelope::{MessageEnvelope, MessageType};
use super::sample::MetricsSample;
use crate::analyzer::process::ProcessAggregate;
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("serializing payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("compressing payload with {algorithm}: {source}")]
    Compress {
        algorithm: Compression,
        #[source]
        source: io::Error,
    },
}

/// Serializes payloads into [`MessageEnvelope`]s.
#[derive(Debug, Clone)]
pub struct SampleEncoder {
    initial_capacity: usize,
    max_size: usize,
    compression: Compression,
}

impl SampleEncoder {
    /// `compression` of [`Compression::None`] disables compression except
    /// for message types that always compress, which fall back to gzip.
    pub fn new(initial_capacity: usize, max_size: usize, compression: Compression) -> Self {
        Self {
            initial_capacity,
            max_size,
            compression,
        }
    }

    fn algorithm_for(&self, message_type: MessageType) -> Compression {
        match self.compression {
            Compression::None if message_type.always_compressed() => Compression::Gzip,
            c => c,
        }
    }

    pub fn try_encode<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        timestamp_ns: u64,
        payload: &T,
    ) -> Result<MessageEnvelope, EncodeError> {
        let mut buf = BoundedBuffer::new(self.initial_capacity, self.max_size);
        serde_json::to_writer(&mut buf, payload).map_err(|e| {
            if e.is_io() {
                EncodeError::TooLarge {
                    limit: self.max_size,
                }
            } else {
                EncodeError::Serialize(e)
            }
        })?;

        let algorithm = self.algorithm_for(message_type);
        let payload = match algorithm {
            Compression::None => buf.into_inner(),
            _ => {
                let out = compress(buf.as_slice(), algorithm)
                    .map_err(|source| EncodeError::Compress { algorithm, source })?;
                if out.len() > self.max_size {
                    return Err(EncodeError::TooLarge {
                        limit: self.max_size,
                    });
                }
                out
            }
        };

        Ok(MessageEnvelope {
            message_type,
            timestamp_ns,
            compression: algorithm,
            payload,
        })
    }

    /// Encodes `payload`, logging and returning `None` on any failure.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        timestamp_ns: u64,
        payload: &T,
    ) -> Option<MessageEnvelope> {
        match self.try_encode(message_type, timestamp_ns, payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                error!(message_type = message_type.as_str(), error = %e, "encoding sample failed");
                None
            }
        }
    }

    /// Encodes one flush's aggregates together with the telemetry snapshot.
    pub fn encode_metrics(
        &self,
        machine_id: &str,
        timestamp_ns: u64,
        aggregates: &[ProcessAggregate],
        telemetry: &TelemetrySnapshot,
    ) -> Option<MessageEnvelope> {
        let sample = MetricsSample::new(machine_id, timestamp_ns, aggregates, telemetry);
        self.encode(MessageType::Metrics, timestamp_ns, &sample)
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::compress::decompress;
    use crate::telemetry::{InternalMetrics, LogCounters};

    #[derive(Serialize)]
    struct Payload {
        name: &'static str,
        values: Vec<u64>,
    }

    fn payload(n: usize) -> Payload {
        Payload {
            name: "sample",
            values: vec![7; n],
        }
    }

    #[test]
    fn test_encode_plain_json() {
        let encoder = SampleEncoder::new(16, 1024, Compression::None);
        let env = encoder
            .encode(MessageType::PolicyEvents, 42, &payload(2))
            .expect("encode");

        assert_eq!(env.message_type, MessageType::PolicyEvents);
        assert_eq!(env.timestamp_ns, 42);
        assert_eq!(env.compression, Compression::None);
        assert_eq!(env.payload, br#"{"name":"sample","values":[7,7]}"#);
    }

    #[test]
    fn test_oversize_payload_returns_none() {
        let encoder = SampleEncoder::new(16, 64, Compression::None);
        assert!(encoder.encode(MessageType::Metrics, 1, &payload(100)).is_none());
        assert!(matches!(
            encoder.try_encode(MessageType::Metrics, 1, &payload(100)),
            Err(EncodeError::TooLarge { limit: 64 })
        ));
    }

    #[test]
    fn test_compression_applied() {
        let encoder = SampleEncoder::new(16, 1 << 20, Compression::Zstd);
        let env = encoder
            .encode(MessageType::Metrics, 1, &payload(1000))
            .expect("encode");

        assert_eq!(env.compression, Compression::Zstd);
        let json = decompress(&env.payload, Compression::Zstd).expect("decompress");
        let value: serde_json::Value = serde_json::from_slice(&json).expect("json");
        assert_eq!(value["values"].as_array().map(Vec::len), Some(1000));
    }

    #[test]
    fn test_audit_tap_always_compressed() {
        let encoder = SampleEncoder::new(16, 1 << 20, Compression::None);
        let env = encoder
            .encode(MessageType::AuditTap, 1, &payload(10))
            .expect("encode");
        assert_eq!(env.compression, Compression::Gzip);

        let metrics = encoder
            .encode(MessageType::Metrics, 1, &payload(10))
            .expect("encode");
        assert_eq!(metrics.compression, Compression::None);
    }

    #[test]
    fn test_encode_metrics_envelope() {
        let encoder = SampleEncoder::new(64, 1 << 20, Compression::None);
        let telemetry = InternalMetrics::new(Arc::new(LogCounters::new())).snapshot();
        let aggregates = vec![ProcessAggregate {
            pid: 9,
            ..Default::default()
        }];

        let env = encoder
            .encode_metrics("m1", 5, &aggregates, &telemetry)
            .expect("encode");
        assert_eq!(env.message_type, MessageType::Metrics);

        let value: serde_json::Value = serde_json::from_slice(&env.payload).expect("json");
        assert_eq!(value["processes"][0]["pid"], 9);
        assert_eq!(value["timestamp_ns"], 5);
    }
}
