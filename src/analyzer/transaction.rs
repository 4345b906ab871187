use serde::Serialize;

/// Direction of a transaction relative to the thread that served or issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The thread served a request (server side).
    Inbound,
    /// The thread issued a request and waited for the answer (client side).
    Outbound,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// A closed span of time during which a thread served or issued one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInterval {
    pub start_ns: u64,
    pub end_ns: u64,
    pub cpu: u16,
    pub direction: Direction,
    pub is_external: bool,
    /// Insertion order, used as the final tie breaker when merging.
    pub seq: u64,
}

impl TransactionInterval {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// A transaction that has started but not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTransaction {
    pub start_ns: u64,
    pub last_activity_ns: u64,
    pub cpu: u16,
    pub direction: Direction,
    pub is_external: bool,
}

/// Count and cumulative time for server and client transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionCounters {
    pub server_count: u64,
    pub server_time_ns: u64,
    pub client_count: u64,
    pub client_time_ns: u64,
}

impl TransactionCounters {
    pub fn add(&mut self, direction: Direction, duration_ns: u64) {
        match direction {
            Direction::Inbound => {
                self.server_count = self.server_count.saturating_add(1);
                self.server_time_ns = self.server_time_ns.saturating_add(duration_ns);
            }
            Direction::Outbound => {
                self.client_count = self.client_count.saturating_add(1);
                self.client_time_ns = self.client_time_ns.saturating_add(duration_ns);
            }
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.server_count = self.server_count.saturating_add(other.server_count);
        self.server_time_ns = self.server_time_ns.saturating_add(other.server_time_ns);
        self.client_count = self.client_count.saturating_add(other.client_count);
        self.client_time_ns = self.client_time_ns.saturating_add(other.client_time_ns);
    }

    pub fn total_count(&self) -> u64 {
        self.server_count.saturating_add(self.client_count)
    }

    pub fn total_time_ns(&self) -> u64 {
        self.server_time_ns.saturating_add(self.client_time_ns)
    }
}

/// Completed transaction intervals, bucketed by CPU and direction.
///
/// The per-CPU vectors grow on demand since CPU ids are only known once
/// events arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerCpuTransactions {
    inbound: Vec<Vec<TransactionInterval>>,
    outbound: Vec<Vec<TransactionInterval>>,
}

impl PerCpuTransactions {
    pub fn push(&mut self, interval: TransactionInterval) {
        let lists = match interval.direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        let cpu = usize::from(interval.cpu);
        if lists.len() <= cpu {
            lists.resize_with(cpu + 1, Vec::new);
        }
        lists[cpu].push(interval);
    }

    /// Number of CPU slots seen in either direction.
    pub fn num_cpus(&self) -> usize {
        self.inbound.len().max(self.outbound.len())
    }

    pub fn cpu(&self, direction: Direction, cpu: usize) -> &[TransactionInterval] {
        let lists = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        lists.get(cpu).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.inbound.iter().map(Vec::len).sum::<usize>()
            + self.outbound.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves every interval of `other` into `self`, leaving `other` empty.
    pub fn absorb(&mut self, other: &mut Self) {
        for list in other.inbound.iter_mut().chain(other.outbound.iter_mut()) {
            for interval in list.drain(..) {
                self.push(interval);
            }
        }
    }

    /// Splits into per-CPU `(inbound, outbound)` lists, consuming the buckets.
    pub fn into_cpu_lists(self) -> Vec<(Vec<TransactionInterval>, Vec<TransactionInterval>)> {
        let ncpus = self.num_cpus();
        let mut inbound = self.inbound.into_iter();
        let mut outbound = self.outbound.into_iter();
        (0..ncpus)
            .map(|_| {
                (
                    inbound.next().unwrap_or_default(),
                    outbound.next().unwrap_or_default(),
                )
            })
            .collect()
    }
}
