use serde::Serialize;

use crate::analyzer::delays::DelayInfo;
use crate::analyzer::process::ProcessAggregate;
use crate::analyzer::thread::{IoCounters, ResourceUsage};
use crate::analyzer::transaction::TransactionCounters;
use crate::telemetry::TelemetrySnapshot;

/// Payload of a [`MessageType::Metrics`](super::envelope::MessageType) envelope.
#[derive(Debug, Serialize)]
pub struct MetricsSample<'a> {
    pub machine_id: &'a str,
    pub timestamp_ns: u64,
    pub processes: Vec<ProcessSample<'a>>,
    pub telemetry: &'a TelemetrySnapshot,
}

#[derive(Debug, Serialize)]
pub struct ProcessSample<'a> {
    pub pid: u32,
    pub roles: Vec<&'static str>,
    pub cpu_time_ns: u64,
    pub per_cpu_time_ns: &'a [u64],
    pub io: &'a IoCounters,
    pub transactions: &'a TransactionCounters,
    pub external_transactions: &'a TransactionCounters,
    pub errors: u64,
    pub expired_transactions: u64,
    pub n_threads: u32,
    pub n_transaction_threads: u32,
    pub resources: &'a ResourceUsage,
    pub capacity_score: f64,
    pub connection_queue_usage_pct: u32,
    pub fd_usage_pct: u32,
    pub delays: &'a DelayInfo,
}

impl<'a> From<&'a ProcessAggregate> for ProcessSample<'a> {
    fn from(agg: &'a ProcessAggregate) -> Self {
        Self {
            pid: agg.pid,
            roles: agg.roles.labels(),
            cpu_time_ns: agg.cpu_time_ns(),
            per_cpu_time_ns: &agg.metrics.cpu_time_ns,
            io: &agg.metrics.io,
            transactions: &agg.metrics.transactions,
            external_transactions: &agg.metrics.external_transactions,
            errors: agg.metrics.errors,
            expired_transactions: agg.metrics.expired_transactions,
            n_threads: agg.n_threads,
            n_transaction_threads: agg.n_transaction_threads,
            resources: &agg.resources,
            capacity_score: agg.capacity_score,
            connection_queue_usage_pct: agg.connection_queue_usage_pct,
            fd_usage_pct: agg.fd_usage_pct,
            delays: &agg.delays,
        }
    }
}

impl<'a> MetricsSample<'a> {
    /// Builds a sample from the flush's aggregates, leaving out the ones
    /// marked `exclude_from_sample`.
    pub fn new(
        machine_id: &'a str,
        timestamp_ns: u64,
        aggregates: &'a [ProcessAggregate],
        telemetry: &'a TelemetrySnapshot,
    ) -> Self {
        Self {
            machine_id,
            timestamp_ns,
            processes: aggregates
                .iter()
                .filter(|a| !a.exclude_from_sample)
                .map(ProcessSample::from)
                .collect(),
            telemetry,
        }
    }
}
