use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::process::{mark_excluded, ProcessAggregateBuilder};
use crate::analyzer::table::{ThreadTable, MAX_CPUS};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::ingest::event::Event;
use crate::ingest::{EventSource, PollStatus};
use crate::protocol::encoder::{now_ns, SampleEncoder};
use crate::protocol::envelope::MessageType;
use crate::protocol::queue::{ProtocolQueue, PutPolicy, QueueError};
use crate::telemetry::procfs::{online_cpus, possible_cpus, ProcSampler};
use crate::telemetry::{InternalMetrics, LogCounters, SubprocessUsage};

/// Longest sleep between polls of an idle source.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// What one flush produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub processes: usize,
    pub threads: usize,
    pub expired_transactions: u64,
    pub subsampling: bool,
    pub enqueued: bool,
}

/// Settings copied out of [`Config`] for the flush thread.
#[derive(Debug, Clone)]
struct FlushSettings {
    interval: Duration,
    transaction_timeout_ns: u64,
    subsampling_event_threshold: u64,
    poll_batch_size: usize,
    machine_id: String,
    exclude_pids: HashSet<u32>,
    sample_processes: bool,
    subprocesses: BTreeMap<String, u32>,
}

/// The analysis thread: ingests events, and at every interval expires
/// transactions, builds aggregates, encodes a metrics sample and enqueues it.
pub struct FlushLoop {
    settings: FlushSettings,
    table: ThreadTable,
    builder: ProcessAggregateBuilder,
    encoder: SampleEncoder,
    queue: Arc<ProtocolQueue>,
    health: Arc<HealthMetrics>,
    telemetry: InternalMetrics,
    sampler: ProcSampler,
    source: Option<Box<dyn EventSource>>,
    source_exhausted: bool,
    malformed_seen: u64,
    rejected_seen: u64,
    window_events: u64,
    shutdown: CancellationToken,
}

impl FlushLoop {
    pub fn new(
        cfg: &Config,
        queue: Arc<ProtocolQueue>,
        health: Arc<HealthMetrics>,
        logs: Arc<LogCounters>,
        shutdown: CancellationToken,
    ) -> Self {
        let settings = FlushSettings {
            interval: cfg.flush.interval,
            transaction_timeout_ns: cfg.flush.transaction_timeout_ns(),
            subsampling_event_threshold: cfg.flush.subsampling_event_threshold,
            poll_batch_size: cfg.flush.poll_batch_size,
            machine_id: cfg.machine_id(),
            exclude_pids: cfg.limits.exclude_pids.iter().copied().collect(),
            sample_processes: cfg.telemetry.sample_processes,
            subprocesses: cfg.telemetry.subprocesses.clone(),
        };

        let max_cpus = match u16::try_from(possible_cpus()) {
            Ok(0) => MAX_CPUS,
            Ok(n) => n,
            Err(_) => u16::MAX,
        };

        Self {
            settings,
            table: ThreadTable::new(cfg.flush.subsampling_timeout_ns()).with_max_cpus(max_cpus),
            builder: ProcessAggregateBuilder::new(cfg.limits.usage_limits(), online_cpus()),
            encoder: cfg.encoder.build(),
            queue,
            health,
            telemetry: InternalMetrics::new(logs),
            sampler: ProcSampler::new(),
            source: None,
            source_exhausted: false,
            malformed_seen: 0,
            rejected_seen: 0,
            window_events: 0,
            shutdown,
        }
    }

    pub fn with_source(mut self, source: Box<dyn EventSource>) -> Self {
        self.source = Some(source);
        self.source_exhausted = false;
        self
    }

    pub fn table(&self) -> &ThreadTable {
        &self.table
    }

    /// Replaces the CPU id limit detected from the host.
    pub fn with_max_cpus(mut self, max_cpus: u16) -> Self {
        self.table = std::mem::take(&mut self.table).with_max_cpus(max_cpus);
        self
    }

    pub fn telemetry(&self) -> &InternalMetrics {
        &self.telemetry
    }

    /// Applies a single event to the thread table.
    pub fn ingest(&mut self, event: &Event) {
        self.table.on_event(event);
        self.window_events += 1;
    }

    /// Pulls one batch from the source. Returns the number of events applied.
    pub fn poll_source(&mut self) -> usize {
        if self.source_exhausted {
            return 0;
        }
        let Some(source) = self.source.as_mut() else {
            return 0;
        };

        let table = &mut self.table;
        let mut delivered = 0usize;
        let status = source.poll(self.settings.poll_batch_size, &mut |event| {
            table.on_event(event);
            delivered += 1;
        });
        self.window_events += delivered as u64;

        let malformed = source.malformed();
        if malformed > self.malformed_seen {
            let new = malformed - self.malformed_seen;
            self.count_malformed(new);
            self.malformed_seen = malformed;
        }

        let source_name = self.source.as_deref().map_or("", |s| s.name());
        match status {
            Ok(PollStatus::Delivered(_)) => {}
            Ok(PollStatus::Exhausted) => {
                info!(source = source_name, "event source exhausted");
                self.source_exhausted = true;
            }
            Err(e) => {
                error!(source = source_name, error = %e, "event source failed, detaching");
                self.source_exhausted = true;
            }
        }
        delivered
    }

    fn count_malformed(&mut self, new: u64) {
        self.telemetry.counters.malformed_events =
            self.telemetry.counters.malformed_events.saturating_add(new);
        self.health.events_malformed.inc_by(new as f64);
    }

    /// Counts events the table refused because of an out-of-range CPU id.
    fn sync_rejected(&mut self) {
        let rejected = self.table.rejected_events();
        if rejected > self.rejected_seen {
            let new = rejected - self.rejected_seen;
            warn!(
                rejected = new,
                max_cpus = self.table.max_cpus(),
                "rejected events with unknown cpu ids"
            );
            self.count_malformed(new);
            self.rejected_seen = rejected;
        }
    }

    fn sample_resources(&mut self) {
        let mains: Vec<u32> = self
            .table
            .iter()
            .filter(|r| r.is_main_thread())
            .map(|r| r.tid())
            .collect();
        for tid in &mains {
            let Some(usage) = self.sampler.sample(*tid) else {
                debug!(pid = tid, "process not readable in /proc");
                continue;
            };
            if let Some(record) = self.table.get_mut(*tid) {
                record.resources = usage;
            }
        }

        let agent_pid = std::process::id();
        if let Some(usage) = self.sampler.sample(agent_pid) {
            self.telemetry.gauges.agent_cpu_pct_x100 = (usage.cpuload * 100.0) as i64;
            self.telemetry.gauges.agent_memory_kb = usage.vmrss_kb as i64;
        }

        let mut watched: HashSet<u32> = mains.into_iter().collect();
        watched.insert(agent_pid);
        for (name, pid) in &self.settings.subprocesses {
            watched.insert(*pid);
            let entry = self
                .telemetry
                .gauges
                .subprocesses
                .entry(name.clone())
                .or_default();
            match self.sampler.sample(*pid) {
                Some(usage) => {
                    entry.cpu_pct_x100 = (usage.cpuload * 100.0) as i64;
                    entry.memory_kb = usage.vmrss_kb as i64;
                }
                None => *entry = SubprocessUsage::default(),
            }
        }
        self.sampler.retain(|pid| watched.contains(&pid));
    }

    /// Runs one flush cycle. Never fails: problems are logged and at worst
    /// the sample for this cycle is lost.
    pub fn flush(&mut self) -> FlushReport {
        let started = Instant::now();
        self.sync_rejected();
        let subsampling = self.window_events > self.settings.subsampling_event_threshold;

        let now = self.table.last_event_ts_ns();
        let expired = if now > 0 {
            self.table.flush_inactive_transactions(
                now,
                self.settings.transaction_timeout_ns,
                subsampling,
            )
        } else {
            0
        };

        if self.settings.sample_processes {
            self.sample_resources();
        }

        let threads = self.table.len();
        mark_excluded(&mut self.table, &self.settings.exclude_pids);
        let aggregates = self.builder.build(&mut self.table);

        let gauges = &mut self.telemetry.gauges;
        gauges.process_count = aggregates.len() as i64;
        gauges.thread_count = threads as i64;
        gauges.queue_depth = self.queue.len() as i64;
        gauges.subsampling = i64::from(subsampling);
        self.telemetry.counters.events += self.window_events;
        self.telemetry.counters.transactions_expired += expired;

        let snapshot = self.telemetry.snapshot();
        self.telemetry.reset();

        let envelope = self.encoder.encode_metrics(
            &self.settings.machine_id,
            now_ns(),
            &aggregates,
            &snapshot,
        );
        let mut sample_len = 0usize;
        let enqueued = match envelope {
            Some(envelope) => {
                sample_len = envelope.payload.len();
                self.health.samples_encoded.inc();
                self.enqueue(envelope)
            }
            None => {
                self.record_drop("encode");
                false
            }
        };

        let elapsed = started.elapsed();
        self.telemetry.gauges.flush_duration_ms = elapsed.as_millis() as i64;
        self.health.flush_duration.observe(elapsed.as_secs_f64());
        self.health.events_received.inc_by(self.window_events as f64);
        self.health.threads_tracked.set(self.table.len() as f64);
        self.health.processes_tracked.set(aggregates.len() as f64);
        self.health.transactions_expired.inc_by(expired as f64);
        self.health.queue_depth.set(self.queue.len() as f64);
        self.health.subsampling.set(f64::from(u8::from(subsampling)));

        info!(
            len = sample_len,
            processes = aggregates.len(),
            threads,
            events = self.window_events,
            drops = snapshot.counters.samples_dropped + u64::from(!enqueued),
            expired,
            subsampling,
            enqueued,
            duration_ms = elapsed.as_millis() as u64,
            "flush complete"
        );
        self.window_events = 0;

        FlushReport {
            processes: aggregates.len(),
            threads,
            expired_transactions: expired,
            subsampling,
            enqueued,
        }
    }

    fn enqueue(&mut self, envelope: crate::protocol::envelope::MessageEnvelope) -> bool {
        let priority = MessageType::Metrics.default_priority();
        match self
            .queue
            .put_with_policy(envelope, priority, PutPolicy::DropAndLog, &self.shutdown)
        {
            Ok(()) => {
                self.health.samples_enqueued.inc();
                true
            }
            Err(QueueError::Full) => {
                self.record_drop("queue_full");
                false
            }
            Err(QueueError::Closed) => {
                self.record_drop("queue_closed");
                false
            }
        }
    }

    fn record_drop(&mut self, reason: &str) {
        self.telemetry.counters.samples_dropped += 1;
        self.health.samples_dropped.with_label_values(&[reason]).inc();
    }

    /// Polls the source and flushes on every interval tick until shutdown.
    pub fn run(mut self) {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "flush loop started"
        );
        let mut next_flush = Instant::now() + self.settings.interval;

        while !self.shutdown.is_cancelled() {
            let now = Instant::now();
            if now >= next_flush {
                self.flush();
                next_flush += self.settings.interval;
                if next_flush < now {
                    next_flush = now + self.settings.interval;
                }
                continue;
            }

            if self.poll_source() == 0 {
                std::thread::sleep(IDLE_POLL.min(next_flush - now));
            }
        }

        info!("flush loop stopped");
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("flush".to_string())
            .spawn(move || self.run())
            .context("spawning flush thread")
    }
}
