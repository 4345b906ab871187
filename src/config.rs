use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::analyzer::process::UsageLimits;
use crate::protocol::buffer::MAX_SERIALIZATION_BUF_SIZE_BYTES;
use crate::protocol::compress::Compression;
use crate::protocol::encoder::SampleEncoder;

/// Top-level configuration for the hostwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this host in emitted samples. Default: the hostname.
    #[serde(default)]
    pub machine_id: String,

    /// Flush cycle and transaction expiry configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Outbound queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Sample encoder configuration.
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Ceilings for usage percentages.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Event source configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Where dequeued envelopes are delivered.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Self-telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Flush cycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Time between flushes. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Open transactions older than this are expired. Default: 100ms.
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// Expiry used while subsampling. Default: 5ms.
    #[serde(default = "default_subsampling_timeout", with = "humantime_serde")]
    pub subsampling_timeout: Duration,

    /// Events per flush above which the agent switches to subsampling.
    /// Default: 500000.
    #[serde(default = "default_subsampling_event_threshold")]
    pub subsampling_event_threshold: u64,

    /// Maximum events pulled from the source per poll. Default: 4096.
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
}

/// Outbound queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued envelopes across all priorities. Default: 1000.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Sleep between retries for producers that retry on a full queue.
    /// Default: 1s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
}

/// Sample encoder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// Initial serialization buffer size in bytes. Default: 64KiB.
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,

    /// Largest payload in bytes. Default: 32000000.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Payload compression (none, gzip, zlib, zstd, snappy). Default: none.
    #[serde(default)]
    pub compression: Compression,
}

/// Ceilings for usage percentages.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Accept backlog length counted as 100%. Default: 128.
    #[serde(default = "default_connection_queue_len")]
    pub connection_queue_len: u32,

    /// File descriptor count counted as 100%. Default: 1024.
    #[serde(default = "default_max_fds")]
    pub max_fds: u64,

    /// Programs left out of emitted samples.
    #[serde(default)]
    pub exclude_pids: Vec<u32>,
}

/// Event source configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct IngestConfig {
    /// NDJSON event file to replay. No source is attached when unset.
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
}

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Log a summary line per envelope.
    #[default]
    Log,
    /// Append wire frames to a file.
    File,
}

/// Where dequeued envelopes are delivered.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    /// Output file for the `file` transport.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Self-telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Sample /proc for tracked programs and agent processes. Default: true.
    #[serde(default = "default_true")]
    pub sample_processes: bool,

    /// Helper processes to report, by name and pid.
    #[serde(default)]
    pub subprocesses: BTreeMap<String, u32>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_transaction_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_subsampling_timeout() -> Duration {
    Duration::from_millis(5)
}

fn default_subsampling_event_threshold() -> u64 {
    500_000
}

fn default_poll_batch_size() -> usize {
    4096
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_initial_buffer_size() -> usize {
    64 * 1024
}

fn default_max_buffer_size() -> usize {
    MAX_SERIALIZATION_BUF_SIZE_BYTES
}

fn default_connection_queue_len() -> u32 {
    128
}

fn default_max_fds() -> u64 {
    1024
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            machine_id: String::new(),
            flush: FlushConfig::default(),
            queue: QueueConfig::default(),
            encoder: EncoderConfig::default(),
            limits: LimitsConfig::default(),
            ingest: IngestConfig::default(),
            transport: TransportConfig::default(),
            health: HealthConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
            transaction_timeout: default_transaction_timeout(),
            subsampling_timeout: default_subsampling_timeout(),
            subsampling_event_threshold: default_subsampling_event_threshold(),
            poll_batch_size: default_poll_batch_size(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            retry_interval: default_retry_interval(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: default_initial_buffer_size(),
            max_buffer_size: default_max_buffer_size(),
            compression: Compression::None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connection_queue_len: default_connection_queue_len(),
            max_fds: default_max_fds(),
            exclude_pids: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_processes: true,
            subprocesses: BTreeMap::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        if self.flush.transaction_timeout.is_zero() {
            bail!("flush.transaction_timeout must be positive");
        }

        if self.flush.subsampling_timeout > self.flush.transaction_timeout {
            bail!("flush.subsampling_timeout must not exceed flush.transaction_timeout");
        }

        if self.flush.poll_batch_size == 0 {
            bail!("flush.poll_batch_size must be positive");
        }

        if self.queue.capacity == 0 {
            bail!("queue.capacity must be positive");
        }

        if self.queue.retry_interval.is_zero() {
            bail!("queue.retry_interval must be positive");
        }

        if self.encoder.max_buffer_size == 0 {
            bail!("encoder.max_buffer_size must be positive");
        }

        if u32::try_from(self.encoder.max_buffer_size).is_err() {
            bail!("encoder.max_buffer_size must fit in a 32-bit frame length");
        }

        if self.encoder.initial_buffer_size > self.encoder.max_buffer_size {
            bail!("encoder.initial_buffer_size must not exceed encoder.max_buffer_size");
        }

        if self.transport.kind == TransportKind::File && self.transport.path.is_none() {
            bail!("transport.path is required for the file transport");
        }

        Ok(())
    }

    /// The configured machine id, or the hostname when unset.
    pub fn machine_id(&self) -> String {
        if !self.machine_id.is_empty() {
            return self.machine_id.clone();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|h| h.trim().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl FlushConfig {
    pub fn transaction_timeout_ns(&self) -> u64 {
        duration_ns(self.transaction_timeout)
    }

    pub fn subsampling_timeout_ns(&self) -> u64 {
        duration_ns(self.subsampling_timeout)
    }
}

impl EncoderConfig {
    pub fn build(&self) -> SampleEncoder {
        SampleEncoder::new(
            self.initial_buffer_size,
            self.max_buffer_size,
            self.compression,
        )
    }
}

impl LimitsConfig {
    pub fn usage_limits(&self) -> UsageLimits {
        UsageLimits {
            connection_queue_len: self.connection_queue_len,
            max_fds: self.max_fds,
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
