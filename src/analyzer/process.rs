use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::delays::{compute_program_delays, DelayInfo};
use super::roles::RoleFlags;
use super::table::ThreadTable;
use super::thread::{ResourceUsage, ThreadMetrics};

/// Ceilings used to turn raw usage into percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageLimits {
    /// Accept backlog length that counts as 100% connection-queue usage.
    pub connection_queue_len: u32,
    /// File descriptor count that counts as 100% fd usage.
    pub max_fds: u64,
}

/// Per-program roll-up built at each flush.
#[derive(Debug, Clone, Default)]
pub struct ProcessAggregate {
    pub pid: u32,
    pub metrics: ThreadMetrics,
    pub n_threads: u32,
    pub n_transaction_threads: u32,
    pub resources: ResourceUsage,
    /// `1 - cpuload / (100 * ncpus)`, or -1 when the CPU count is unknown.
    pub capacity_score: f64,
    pub connection_queue_usage_pct: u32,
    pub fd_usage_pct: u32,
    pub roles: RoleFlags,
    pub delays: DelayInfo,
    pub exclude_from_sample: bool,
}

impl ProcessAggregate {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    pub fn cpu_time_ns(&self) -> u64 {
        self.metrics.total_cpu_time_ns()
    }
}

/// Builds [`ProcessAggregate`]s from the thread table.
#[derive(Debug, Clone)]
pub struct ProcessAggregateBuilder {
    limits: UsageLimits,
    ncpus: u32,
}

impl ProcessAggregateBuilder {
    pub fn new(limits: UsageLimits, ncpus: u32) -> Self {
        Self { limits, ncpus }
    }

    /// Folds every thread into its program's aggregate and zeroes the
    /// per-thread metrics. Threads whose main thread is not tracked are
    /// cleared without being counted anywhere. Output is sorted by pid.
    pub fn build(&self, table: &mut ThreadTable) -> Vec<ProcessAggregate> {
        let programs: HashSet<u32> = table
            .iter()
            .filter(|r| r.is_main_thread())
            .map(|r| r.program_id)
            .collect();

        let mut aggregates: BTreeMap<u32, ProcessAggregate> = BTreeMap::new();
        let mut queue_len: BTreeMap<u32, u32> = BTreeMap::new();

        for record in table.iter_mut() {
            if !programs.contains(&record.program_id) {
                debug!(
                    tid = record.tid(),
                    program_id = record.program_id,
                    "thread without main thread, clearing metrics"
                );
                record.metrics.clear();
                continue;
            }

            let program_id = record.program_id;
            let agg = aggregates
                .entry(program_id)
                .or_insert_with(|| ProcessAggregate::new(program_id));
            agg.n_threads += 1;
            if record.metrics.has_transactions() {
                agg.n_transaction_threads += 1;
            }
            agg.roles |= record.roles & RoleFlags::NETWORK_ROLES;

            // Memory, load and fds are process-wide and sampled on the main
            // thread; page faults are per thread.
            let (pfmajor, pfminor) = (agg.resources.pfmajor, agg.resources.pfminor);
            if record.is_main_thread() {
                agg.resources = record.resources;
                agg.exclude_from_sample = record.exclude_from_sample;
                agg.resources.pfmajor = agg.resources.pfmajor.saturating_add(pfmajor);
                agg.resources.pfminor = agg.resources.pfminor.saturating_add(pfminor);
            } else {
                agg.resources.pfmajor = pfmajor.saturating_add(record.resources.pfmajor);
                agg.resources.pfminor = pfminor.saturating_add(record.resources.pfminor);
            }

            let len = queue_len.entry(program_id).or_default();
            *len = (*len).max(record.connection_queue_len);

            agg.metrics.absorb(&mut record.metrics);
        }

        aggregates
            .into_values()
            .map(|mut agg| {
                let lists = std::mem::take(&mut agg.metrics.transaction_lists);
                agg.delays = compute_program_delays(
                    lists,
                    &agg.metrics.transactions,
                    &agg.metrics.external_transactions,
                );
                agg.capacity_score = capacity_score(agg.resources.cpuload, self.ncpus);
                agg.connection_queue_usage_pct = usage_pct(
                    u64::from(queue_len.get(&agg.pid).copied().unwrap_or(0)),
                    u64::from(self.limits.connection_queue_len),
                );
                agg.fd_usage_pct = usage_pct(agg.resources.fd_count, self.limits.max_fds);
                agg
            })
            .collect()
    }
}

/// `used` as a percentage of `ceiling`, 0 when there is no ceiling.
pub fn usage_pct(used: u64, ceiling: u64) -> u32 {
    if ceiling == 0 {
        return 0;
    }
    let pct = used.saturating_mul(100) / ceiling;
    u32::try_from(pct).unwrap_or(u32::MAX)
}

pub fn capacity_score(cpuload: f64, ncpus: u32) -> f64 {
    if ncpus == 0 {
        return -1.0;
    }
    (1.0 - cpuload / (100.0 * f64::from(ncpus))).clamp(0.0, 1.0)
}

/// Flags main-thread records whose pid is in `excluded`. The next build
/// carries the flag onto the aggregate so encoders skip it.
pub fn mark_excluded(table: &mut ThreadTable, excluded: &HashSet<u32>) {
    for record in table.iter_mut().filter(|r| r.is_main_thread()) {
        record.exclude_from_sample = excluded.contains(&record.tid());
    }
}

// Comparators sort descending: the busiest program comes first.

pub fn cmp_cpu(a: &ProcessAggregate, b: &ProcessAggregate) -> Ordering {
    b.resources
        .cpuload
        .total_cmp(&a.resources.cpuload)
        .then_with(|| b.cpu_time_ns().cmp(&a.cpu_time_ns()))
}

pub fn cmp_memory(a: &ProcessAggregate, b: &ProcessAggregate) -> Ordering {
    b.resources.vmrss_kb.cmp(&a.resources.vmrss_kb)
}

pub fn cmp_io(a: &ProcessAggregate, b: &ProcessAggregate) -> Ordering {
    b.metrics.io.file_bytes().cmp(&a.metrics.io.file_bytes())
}

pub fn cmp_net(a: &ProcessAggregate, b: &ProcessAggregate) -> Ordering {
    b.metrics.io.net_bytes().cmp(&a.metrics.io.net_bytes())
}

pub fn cmp_transactions(a: &ProcessAggregate, b: &ProcessAggregate) -> Ordering {
    b.metrics
        .transactions
        .total_count()
        .cmp(&a.metrics.transactions.total_count())
}
