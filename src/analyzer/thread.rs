use serde::Serialize;

use super::roles::RoleFlags;
use super::transaction::{
    Direction, OpenTransaction, PerCpuTransactions, TransactionCounters, TransactionInterval,
};

/// Byte and operation counters split by file and network traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoCounters {
    pub file_bytes_in: u64,
    pub file_bytes_out: u64,
    pub net_bytes_in: u64,
    pub net_bytes_out: u64,
    pub reads: u64,
    pub writes: u64,
    pub connects: u64,
    pub accepts: u64,
    pub closes: u64,
}

impl IoCounters {
    pub fn merge(&mut self, other: &Self) {
        self.file_bytes_in = self.file_bytes_in.saturating_add(other.file_bytes_in);
        self.file_bytes_out = self.file_bytes_out.saturating_add(other.file_bytes_out);
        self.net_bytes_in = self.net_bytes_in.saturating_add(other.net_bytes_in);
        self.net_bytes_out = self.net_bytes_out.saturating_add(other.net_bytes_out);
        self.reads = self.reads.saturating_add(other.reads);
        self.writes = self.writes.saturating_add(other.writes);
        self.connects = self.connects.saturating_add(other.connects);
        self.accepts = self.accepts.saturating_add(other.accepts);
        self.closes = self.closes.saturating_add(other.closes);
    }

    pub fn file_bytes(&self) -> u64 {
        self.file_bytes_in.saturating_add(self.file_bytes_out)
    }

    pub fn net_bytes(&self) -> u64 {
        self.net_bytes_in.saturating_add(self.net_bytes_out)
    }
}

/// Resource usage sampled from the OS for a thread or process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// CPU load in percent of one core.
    pub cpuload: f64,
    pub vmsize_kb: u64,
    pub vmrss_kb: u64,
    pub vmswap_kb: u64,
    pub pfmajor: u64,
    pub pfminor: u64,
    pub fd_count: u64,
}

/// Metrics accumulated for one thread over a flush window.
#[derive(Debug, Clone, Default)]
pub struct ThreadMetrics {
    /// Busy time in nanoseconds, indexed by CPU id.
    pub cpu_time_ns: Vec<u64>,
    pub io: IoCounters,
    pub transactions: TransactionCounters,
    /// Subset of `transactions` whose peer is on another machine.
    pub external_transactions: TransactionCounters,
    pub transaction_lists: PerCpuTransactions,
    pub errors: u64,
    pub expired_transactions: u64,
}

impl ThreadMetrics {
    pub fn add_cpu_time(&mut self, cpu: u16, ns: u64) {
        let cpu = usize::from(cpu);
        if self.cpu_time_ns.len() <= cpu {
            self.cpu_time_ns.resize(cpu + 1, 0);
        }
        self.cpu_time_ns[cpu] = self.cpu_time_ns[cpu].saturating_add(ns);
    }

    pub fn total_cpu_time_ns(&self) -> u64 {
        self.cpu_time_ns
            .iter()
            .fold(0u64, |acc, ns| acc.saturating_add(*ns))
    }

    pub fn record_transaction(&mut self, interval: TransactionInterval) {
        let duration = interval.duration_ns();
        self.transactions.add(interval.direction, duration);
        if interval.is_external {
            self.external_transactions.add(interval.direction, duration);
        }
        self.transaction_lists.push(interval);
    }

    pub fn has_transactions(&self) -> bool {
        self.transactions.total_count() > 0
    }

    /// Folds `other` into `self` and leaves `other` zeroed.
    pub fn absorb(&mut self, other: &mut Self) {
        let other_cpu = std::mem::take(&mut other.cpu_time_ns);
        for (cpu, ns) in other_cpu.into_iter().enumerate() {
            if ns > 0 {
                if self.cpu_time_ns.len() <= cpu {
                    self.cpu_time_ns.resize(cpu + 1, 0);
                }
                self.cpu_time_ns[cpu] = self.cpu_time_ns[cpu].saturating_add(ns);
            }
        }
        self.io.merge(&std::mem::take(&mut other.io));
        self.transactions
            .merge(&std::mem::take(&mut other.transactions));
        self.external_transactions
            .merge(&std::mem::take(&mut other.external_transactions));
        self.transaction_lists.absorb(&mut other.transaction_lists);
        self.errors = self.errors.saturating_add(std::mem::take(&mut other.errors));
        self.expired_transactions = self
            .expired_transactions
            .saturating_add(std::mem::take(&mut other.expired_transactions));
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Analyzer state for a single thread.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    tid: u32,
    pid: u32,
    /// Main-thread pid this record's metrics are folded into.
    pub program_id: u32,
    pub roles: RoleFlags,
    pub metrics: ThreadMetrics,
    pub(crate) open_transactions: Vec<OpenTransaction>,
    pub exclude_from_sample: bool,
    pub resources: ResourceUsage,
    /// Last observed accept backlog length for listening sockets.
    pub connection_queue_len: u32,
    pub last_wait_duration_ns: u64,
    pub last_wait_end_ns: u64,
}

impl ThreadRecord {
    pub fn new(tid: u32, pid: u32) -> Self {
        let mut roles = RoleFlags::empty();
        roles.set_main_program_thread(tid == pid);
        Self {
            tid,
            pid,
            program_id: pid,
            roles,
            metrics: ThreadMetrics::default(),
            open_transactions: Vec::new(),
            exclude_from_sample: false,
            resources: ResourceUsage::default(),
            connection_queue_len: 0,
            last_wait_duration_ns: 0,
            last_wait_end_ns: 0,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Owning process id, fixed at creation.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_main_thread(&self) -> bool {
        self.roles.is_main_program_thread()
    }

    pub fn open_transactions(&self) -> &[OpenTransaction] {
        &self.open_transactions
    }

    pub fn open_transaction(&self, direction: Direction) -> Option<&OpenTransaction> {
        self.open_transactions
            .iter()
            .find(|t| t.direction == direction)
    }

    pub fn open_transaction_mut(&mut self, direction: Direction) -> Option<&mut OpenTransaction> {
        self.open_transactions
            .iter_mut()
            .find(|t| t.direction == direction)
    }
}
