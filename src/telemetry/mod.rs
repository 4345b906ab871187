//! Agent self-telemetry: log severity counters plus gauges and counters
//! describing the agent's own health, emitted with every metrics sample.

pub mod layer;
pub mod procfs;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Gauge value meaning "never set"; skipped when emitting.
pub const UNSET: i64 = -1;

/// Log severities counted by [`LogCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
}

impl Severity {
    /// Maps a tracing level; `TRACE` counts as debug.
    pub fn from_level(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// Lock-free per-severity log counters.
///
/// `notify` is called from inside the logging pipeline, so it must never
/// log itself.
#[derive(Debug, Default)]
pub struct LogCounters {
    error: AtomicU64,
    warn: AtomicU64,
    info: AtomicU64,
    debug: AtomicU64,
}

impl LogCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, severity: Severity) -> &AtomicU64 {
        match severity {
            Severity::Error => &self.error,
            Severity::Warn => &self.warn,
            Severity::Info => &self.info,
            Severity::Debug => &self.debug,
        }
    }

    pub fn notify(&self, severity: Severity) {
        self.counter(severity).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, severity: Severity) -> u64 {
        self.counter(severity).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LogCountsSnapshot {
        LogCountsSnapshot {
            error: self.get(Severity::Error),
            warn: self.get(Severity::Warn),
            info: self.get(Severity::Info),
            debug: self.get(Severity::Debug),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.error, &self.warn, &self.info, &self.debug] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogCountsSnapshot {
    pub error: u64,
    pub warn: u64,
    pub info: u64,
    pub debug: u64,
}

/// CPU and memory of a helper process the agent supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubprocessUsage {
    /// CPU in hundredths of a percent of one core.
    pub cpu_pct_x100: i64,
    pub memory_kb: i64,
}

impl Default for SubprocessUsage {
    fn default() -> Self {
        Self {
            cpu_pct_x100: UNSET,
            memory_kb: UNSET,
        }
    }
}

/// Last-known values, written by the flush thread only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gauges {
    pub process_count: i64,
    pub thread_count: i64,
    pub agent_cpu_pct_x100: i64,
    pub agent_memory_kb: i64,
    pub flush_duration_ms: i64,
    pub queue_depth: i64,
    pub subsampling: i64,
    pub subprocesses: BTreeMap<String, SubprocessUsage>,
}

impl Default for Gauges {
    fn default() -> Self {
        Self {
            process_count: UNSET,
            thread_count: UNSET,
            agent_cpu_pct_x100: UNSET,
            agent_memory_kb: UNSET,
            flush_duration_ms: UNSET,
            queue_depth: UNSET,
            subsampling: UNSET,
            subprocesses: BTreeMap::new(),
        }
    }
}

/// Per-window totals, zeroed by [`InternalMetrics::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub events: u64,
    pub malformed_events: u64,
    pub samples_dropped: u64,
    pub transactions_expired: u64,
}

/// Self-telemetry owned by the flush thread.
///
/// Log counters are shared with the logging layer; everything else is
/// single-writer and needs no synchronization.
#[derive(Debug)]
pub struct InternalMetrics {
    logs: Arc<LogCounters>,
    pub gauges: Gauges,
    pub counters: Counters,
}

impl InternalMetrics {
    pub fn new(logs: Arc<LogCounters>) -> Self {
        Self {
            logs,
            gauges: Gauges::default(),
            counters: Counters::default(),
        }
    }

    pub fn logs(&self) -> &Arc<LogCounters> {
        &self.logs
    }

    pub fn notify(&self, severity: Severity) {
        self.logs.notify(severity);
    }

    /// Zeroes log counters and per-window totals; gauges keep their values.
    pub fn reset(&mut self) {
        self.logs.reset();
        self.counters = Counters::default();
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let g = &self.gauges;
        TelemetrySnapshot {
            logs: self.logs.snapshot(),
            counters: self.counters,
            process_count: set(g.process_count),
            thread_count: set(g.thread_count),
            agent_cpu_pct_x100: set(g.agent_cpu_pct_x100),
            agent_memory_kb: set(g.agent_memory_kb),
            flush_duration_ms: set(g.flush_duration_ms),
            queue_depth: set(g.queue_depth),
            subsampling: set(g.subsampling),
            subprocesses: g
                .subprocesses
                .iter()
                .filter_map(|(name, usage)| {
                    let snap = SubprocessSnapshot {
                        cpu_pct_x100: set(usage.cpu_pct_x100),
                        memory_kb: set(usage.memory_kb),
                    };
                    (snap.cpu_pct_x100.is_some() || snap.memory_kb.is_some())
                        .then(|| (name.clone(), snap))
                })
                .collect(),
        }
    }
}

fn set(v: i64) -> Option<i64> {
    (v != UNSET).then_some(v)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubprocessSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct_x100: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<i64>,
}

/// Read-only view of [`InternalMetrics`] taken once per flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub logs: LogCountsSnapshot,
    pub counters: Counters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_cpu_pct_x100: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_memory_kb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsampling: Option<i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub subprocesses: BTreeMap<String, SubprocessSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_counts_each_severity() {
        let logs = LogCounters::new();
        logs.notify(Severity::Error);
        logs.notify(Severity::Warn);
        logs.notify(Severity::Warn);
        logs.notify(Severity::Debug);

        assert_eq!(
            logs.snapshot(),
            LogCountsSnapshot {
                error: 1,
                warn: 2,
                info: 0,
                debug: 1,
            }
        );
    }

    #[test]
    fn test_notify_from_many_threads() {
        let logs = Arc::new(LogCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let logs = Arc::clone(&logs);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        logs.notify(Severity::Info);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker");
        }
        assert_eq!(logs.get(Severity::Info), 4000);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let mut metrics = InternalMetrics::new(Arc::new(LogCounters::new()));
        metrics.notify(Severity::Error);
        metrics.counters.events = 12;
        metrics.gauges.process_count = 7;

        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.logs, LogCountsSnapshot::default());
        assert_eq!(snap.counters, Counters::default());
        assert_eq!(snap.process_count, Some(7));
    }

    #[test]
    fn test_unset_gauges_are_skipped() {
        let mut metrics = InternalMetrics::new(Arc::new(LogCounters::new()));
        metrics.gauges.thread_count = 3;
        metrics
            .gauges
            .subprocesses
            .insert("idle".to_string(), SubprocessUsage::default());

        let json = serde_json::to_value(metrics.snapshot()).expect("serialize");
        let obj = json.as_object().expect("object");

        assert_eq!(obj["thread_count"], 3);
        assert!(!obj.contains_key("process_count"));
        assert!(!obj.contains_key("agent_memory_kb"));
        assert!(!obj.contains_key("subprocesses"));
    }

    #[test]
    fn test_severity_from_level() {
        assert_eq!(Severity::from_level(&tracing::Level::ERROR), Severity::Error);
        assert_eq!(Severity::from_level(&tracing::Level::TRACE), Severity::Debug);
    }
}
