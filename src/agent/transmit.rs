use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{TransportConfig, TransportKind};
use crate::export::health::HealthMetrics;
use crate::protocol::envelope::MessageEnvelope;
use crate::protocol::queue::ProtocolQueue;

/// Destination for dequeued envelopes.
pub trait Transport: Send {
    fn name(&self) -> &str;

    fn send(&mut self, envelope: &MessageEnvelope) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs one line per envelope. Useful when no collector is attached.
pub struct LogTransport;

impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        info!(
            message_type = envelope.message_type.as_str(),
            compression = envelope.compression.as_str(),
            timestamp = %format_timestamp(envelope.timestamp_ns),
            payload_bytes = envelope.payload.len(),
            "envelope"
        );
        Ok(())
    }
}

/// Appends wire frames (header plus payload) to a file.
pub struct FileTransport {
    writer: BufWriter<File>,
}

impl FileTransport {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening transport file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Transport for FileTransport {
    fn name(&self) -> &str {
        "file"
    }

    fn send(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        let frame = envelope.to_bytes().context("framing envelope")?;
        self.writer
            .write_all(&frame)
            .context("writing envelope frame")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flushing transport file")
    }
}

pub fn build_transport(cfg: &TransportConfig) -> Result<Box<dyn Transport>> {
    match cfg.kind {
        TransportKind::Log => Ok(Box::new(LogTransport)),
        TransportKind::File => {
            let path = cfg
                .path
                .as_deref()
                .context("transport.path is required for the file transport")?;
            Ok(Box::new(FileTransport::open(path)?))
        }
    }
}

/// Delivers envelopes until the queue is closed. Failed sends are counted
/// and the envelope is discarded.
pub fn run_transmitter(
    queue: &ProtocolQueue,
    transport: &mut dyn Transport,
    health: &HealthMetrics,
) -> u64 {
    let mut sent = 0u64;
    while let Some(item) = queue.get() {
        health.queue_depth.set(queue.len() as f64);
        match transport.send(&item.envelope) {
            Ok(()) => {
                sent += 1;
                health.envelopes_sent.inc();
            }
            Err(e) => {
                health.transport_errors.inc();
                warn!(
                    transport = transport.name(),
                    message_type = item.envelope.message_type.as_str(),
                    error = %e,
                    "sending envelope failed"
                );
            }
        }
        // Frames are flushed whenever the queue runs dry.
        if queue.is_empty() {
            if let Err(e) = transport.flush() {
                health.transport_errors.inc();
                warn!(transport = transport.name(), error = %e, "flushing transport failed");
            }
        }
    }

    if let Err(e) = transport.flush() {
        warn!(transport = transport.name(), error = %e, "final transport flush failed");
    }
    info!(transport = transport.name(), sent, "transmitter stopped");
    sent
}

pub fn spawn_transmitter(
    queue: Arc<ProtocolQueue>,
    mut transport: Box<dyn Transport>,
    health: Arc<HealthMetrics>,
) -> Result<JoinHandle<u64>> {
    std::thread::Builder::new()
        .name("transmit".to_string())
        .spawn(move || run_transmitter(&queue, transport.as_mut(), &health))
        .context("spawning transmit thread")
}

fn format_timestamp(timestamp_ns: u64) -> String {
    let dt: DateTime<Utc> = (UNIX_EPOCH + Duration::from_nanos(timestamp_ns)).into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::protocol::compress::Compression;
    use crate::protocol::envelope::{MessageType, HEADER_LEN};
    use crate::protocol::queue::Priority;

    fn envelope(message_type: MessageType, payload: &[u8]) -> MessageEnvelope {
        MessageEnvelope {
            message_type,
            timestamp_ns: 1_700_000_000_000_000_000,
            compression: Compression::None,
            payload: payload.to_vec(),
        }
    }

    struct Recording {
        sent: Vec<MessageType>,
        fail_on: Option<MessageType>,
    }

    impl Transport for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn send(&mut self, envelope: &MessageEnvelope) -> Result<()> {
            if self.fail_on == Some(envelope.message_type) {
                bail!("refused");
            }
            self.sent.push(envelope.message_type);
            Ok(())
        }
    }

    #[test]
    fn test_transmitter_stops_on_closed_queue() {
        let queue = ProtocolQueue::new(8);
        let health = HealthMetrics::new("127.0.0.1:0").expect("health");
        queue
            .put(envelope(MessageType::Metrics, b"m"), Priority::Medium)
            .expect("put");
        queue
            .put(envelope(MessageType::SessionData, b"s"), Priority::High)
            .expect("put");
        queue.close();

        let mut transport = Recording {
            sent: Vec::new(),
            fail_on: None,
        };
        // A closed queue hands back nothing further.
        let sent = run_transmitter(&queue, &mut transport, &health);
        assert_eq!(sent, 0);
        assert_eq!(queue.drain().len(), 2);
    }

    #[test]
    fn test_transmitter_counts_failures() {
        let queue = Arc::new(ProtocolQueue::new(8));
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));
        queue
            .put(envelope(MessageType::Metrics, b"m"), Priority::Medium)
            .expect("put");
        queue
            .put(envelope(MessageType::SessionData, b"s"), Priority::High)
            .expect("put");

        let transport = Box::new(Recording {
            sent: Vec::new(),
            fail_on: Some(MessageType::Metrics),
        });
        let handle =
            spawn_transmitter(Arc::clone(&queue), transport, Arc::clone(&health)).expect("spawn");

        while !queue.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(handle.join().expect("join"), 1);
        assert_eq!(health.envelopes_sent.get(), 1.0);
        assert_eq!(health.transport_errors.get(), 1.0);
    }

    #[test]
    fn test_file_transport_writes_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frames.bin");
        let cfg = TransportConfig {
            kind: TransportKind::File,
            path: Some(path.clone()),
        };

        let mut transport = build_transport(&cfg).expect("transport");
        transport
            .send(&envelope(MessageType::Metrics, b"{}"))
            .expect("send");
        transport.flush().expect("flush");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes.len(), HEADER_LEN + 2);
        let decoded = MessageEnvelope::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.message_type, MessageType::Metrics);
        assert_eq!(decoded.payload, b"{}");
    }

    #[test]
    fn test_file_transport_requires_path() {
        let cfg = TransportConfig {
            kind: TransportKind::File,
            path: None,
        };
        assert!(build_transport(&cfg).is_err());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_500_000_000), "1970-01-01 00:00:01.500");
    }
}
