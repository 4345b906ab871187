use serde::{Serialize, Serializer};

use super::transaction::{PerCpuTransactions, TransactionCounters, TransactionInterval};

/// A half-open busy span `[start_ns, end_ns)` produced by merging intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl Span {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Merges intervals into a sorted, pairwise non-overlapping union.
///
/// Ordering is by start ascending, then longer duration first, then
/// insertion sequence, so the result does not depend on input order.
/// Adjacent intervals (`next.start == cur.end`) are merged.
pub fn merge_intervals(intervals: &mut [TransactionInterval]) -> Vec<Span> {
    intervals.sort_unstable_by(|a, b| {
        a.start_ns
            .cmp(&b.start_ns)
            .then_with(|| b.duration_ns().cmp(&a.duration_ns()))
            .then_with(|| a.seq.cmp(&b.seq))
    });

    let mut out: Vec<Span> = Vec::with_capacity(intervals.len());
    for iv in intervals.iter() {
        let end_ns = iv.end_ns.max(iv.start_ns);
        match out.last_mut() {
            Some(cur) if iv.start_ns <= cur.end_ns => {
                cur.end_ns = cur.end_ns.max(end_ns);
            }
            _ => out.push(Span {
                start_ns: iv.start_ns,
                end_ns,
            }),
        }
    }
    out
}

pub fn union_duration_ns(spans: &[Span]) -> u64 {
    spans.iter().map(Span::duration_ns).sum()
}

/// Total time covered by both of two sorted, non-overlapping span lists.
pub fn intersection_ns(a: &[Span], b: &[Span]) -> u64 {
    let (mut i, mut j, mut total) = (0, 0, 0u64);
    while i < a.len() && j < b.len() {
        let start = a[i].start_ns.max(b[j].start_ns);
        let end = a[i].end_ns.min(b[j].end_ns);
        if end > start {
            total += end - start;
        }
        if a[i].end_ns < b[j].end_ns {
            i += 1;
        } else {
            j += 1;
        }
    }
    total
}

/// Merged busy time of one CPU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuDelays {
    pub cpu: u16,
    #[serde(skip)]
    pub inbound_union: Vec<Span>,
    #[serde(skip)]
    pub outbound_union: Vec<Span>,
    pub inbound_ns: u64,
    pub outbound_ns: u64,
}

/// Share of transaction time spent talking to other machines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalRemoteRatio {
    Ratio(f32),
    /// No transaction time was observed.
    Undefined,
}

impl LocalRemoteRatio {
    pub fn value(self) -> Option<f32> {
        match self {
            Self::Ratio(r) => Some(r),
            Self::Undefined => None,
        }
    }
}

impl Default for LocalRemoteRatio {
    fn default() -> Self {
        Self::Undefined
    }
}

impl Serialize for LocalRemoteRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value().serialize(serializer)
    }
}

/// Latency figures for one program aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DelayInfo {
    pub per_cpu: Vec<CpuDelays>,
    pub merged_inbound_delay_ns: u64,
    pub merged_outbound_delay_ns: u64,
    pub local_processing_delay_ns: u64,
    pub local_remote_ratio: LocalRemoteRatio,
}

/// Computes merged delays from a program's completed transactions.
///
/// Busy time is merged per CPU and then summed across CPUs. Local processing
/// delay is inbound busy time minus the outbound time that falls inside the
/// inbound union on the same CPU.
pub fn compute_program_delays(
    lists: PerCpuTransactions,
    totals: &TransactionCounters,
    external: &TransactionCounters,
) -> DelayInfo {
    let mut info = DelayInfo::default();

    for (cpu, (mut inbound, mut outbound)) in lists.into_cpu_lists().into_iter().enumerate() {
        if inbound.is_empty() && outbound.is_empty() {
            continue;
        }
        let inbound_union = merge_intervals(&mut inbound);
        let outbound_union = merge_intervals(&mut outbound);
        let inbound_ns = union_duration_ns(&inbound_union);
        let outbound_ns = union_duration_ns(&outbound_union);
        let remote_ns = intersection_ns(&inbound_union, &outbound_union);

        info.merged_inbound_delay_ns = info.merged_inbound_delay_ns.saturating_add(inbound_ns);
        info.merged_outbound_delay_ns = info.merged_outbound_delay_ns.saturating_add(outbound_ns);
        info.local_processing_delay_ns = info
            .local_processing_delay_ns
            .saturating_add(inbound_ns.saturating_sub(remote_ns));
        info.per_cpu.push(CpuDelays {
            cpu: u16::try_from(cpu).unwrap_or(u16::MAX),
            inbound_union,
            outbound_union,
            inbound_ns,
            outbound_ns,
        });
    }

    info.local_remote_ratio = local_remote_ratio(totals, external);
    info
}

fn local_remote_ratio(totals: &TransactionCounters, external: &TransactionCounters) -> LocalRemoteRatio {
    let total = totals.total_time_ns();
    if total == 0 {
        return LocalRemoteRatio::Undefined;
    }
    let ratio = external.total_time_ns() as f64 / total as f64;
    LocalRemoteRatio::Ratio(ratio.clamp(0.0, 1.0) as f32)
}
