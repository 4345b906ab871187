use std::collections::HashMap;
use std::fs;
use std::time::Instant;

use crate::analyzer::thread::ResourceUsage;

/// Fields of `/proc/<pid>/stat` used for CPU and fault accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStat {
    pub minflt: u64,
    pub majflt: u64,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub num_threads: u64,
}

/// Memory fields of `/proc/<pid>/status`, in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcMemory {
    pub vmsize_kb: u64,
    pub vmrss_kb: u64,
    pub vmswap_kb: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(stat: &str) -> Option<ProcStat> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3 in proc(5)).
    let field = |n: usize| -> Option<u64> { fields.get(n - 3)?.parse().ok() };
    Some(ProcStat {
        minflt: field(10)?,
        majflt: field(12)?,
        utime_ticks: field(14)?,
        stime_ticks: field(15)?,
        num_threads: field(20)?,
    })
}

pub fn parse_memory(status: &str) -> Option<ProcMemory> {
    let memory = ProcMemory {
        vmsize_kb: parse_status_u64(status, "VmSize:").unwrap_or(0),
        vmrss_kb: parse_status_u64(status, "VmRSS:").unwrap_or(0),
        vmswap_kb: parse_status_u64(status, "VmSwap:").unwrap_or(0),
    };
    if memory == ProcMemory::default() {
        // Kernel threads report no Vm* lines.
        return None;
    }
    Some(memory)
}

fn parse_status_u64(status: &str, key: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn read_stat(pid: u32) -> Option<ProcStat> {
    parse_stat(&fs::read_to_string(format!("/proc/{pid}/stat")).ok()?)
}

fn read_memory(pid: u32) -> Option<ProcMemory> {
    parse_memory(&fs::read_to_string(format!("/proc/{pid}/status")).ok()?)
}

fn read_fd_count(pid: u32) -> Option<u64> {
    let entries = fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(entries.filter(Result::is_ok).count() as u64)
}

fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Number of online CPUs, 0 when unknown.
pub fn online_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Parses a kernel cpu list such as `0-3,8-11` and returns the highest id
/// plus one.
pub fn parse_cpu_list(list: &str) -> Option<u32> {
    let mut highest: Option<u32> = None;
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let last = part.rsplit('-').next()?;
        let id: u32 = last.trim().parse().ok()?;
        highest = Some(highest.map_or(id, |h| h.max(id)));
    }
    highest.map(|h| h.saturating_add(1))
}

/// Number of CPU ids the kernel may report, from
/// `/sys/devices/system/cpu/possible`. Falls back to [`online_cpus`].
pub fn possible_cpus() -> u32 {
    fs::read_to_string("/sys/devices/system/cpu/possible")
        .ok()
        .and_then(|list| parse_cpu_list(&list))
        .unwrap_or_else(online_cpus)
}

/// Samples process resource usage, computing CPU load from the tick delta
/// since the previous sample of the same pid.
#[derive(Debug)]
pub struct ProcSampler {
    ticks_per_sec: u64,
    previous: HashMap<u32, (Instant, u64)>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            ticks_per_sec: clock_ticks_per_sec(),
            previous: HashMap::new(),
        }
    }

    /// Returns `None` when the process is gone or unreadable. The first
    /// sample of a pid reports zero CPU load.
    pub fn sample(&mut self, pid: u32) -> Option<ResourceUsage> {
        let stat = read_stat(pid)?;
        let memory = read_memory(pid).unwrap_or_default();
        let now = Instant::now();
        let ticks = stat.utime_ticks + stat.stime_ticks;

        let cpuload = match self.previous.insert(pid, (now, ticks)) {
            Some((then, prev_ticks)) => {
                cpu_load_pct(ticks.saturating_sub(prev_ticks), self.ticks_per_sec, (now - then).as_secs_f64())
            }
            None => 0.0,
        };

        Some(ResourceUsage {
            cpuload,
            vmsize_kb: memory.vmsize_kb,
            vmrss_kb: memory.vmrss_kb,
            vmswap_kb: memory.vmswap_kb,
            pfmajor: stat.majflt,
            pfminor: stat.minflt,
            fd_count: read_fd_count(pid).unwrap_or(0),
        })
    }

    /// Forgets pids not in `alive`.
    pub fn retain(&mut self, alive: impl Fn(u32) -> bool) {
        self.previous.retain(|pid, _| alive(*pid));
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU load in percent of one core for `ticks` consumed over `elapsed_secs`.
pub fn cpu_load_pct(ticks: u64, ticks_per_sec: u64, elapsed_secs: f64) -> f64 {
    if ticks_per_sec == 0 || elapsed_secs <= 0.0 {
        return 0.0;
    }
    ticks as f64 / ticks_per_sec as f64 / elapsed_secs * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 \
        5000 0 12 0 700 300 0 0 20 0 9 0 100 2000000 500 18446744073709551615";

    #[test]
    fn test_parse_stat_with_parens_in_comm() {
        let stat = parse_stat(STAT).expect("valid stat");
        assert_eq!(stat.minflt, 5000);
        assert_eq!(stat.majflt, 12);
        assert_eq!(stat.utime_ticks, 700);
        assert_eq!(stat.stime_ticks, 300);
        assert_eq!(stat.num_threads, 9);
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-63\n"), Some(64));
        assert_eq!(parse_cpu_list("0-3,8-11"), Some(12));
        assert_eq!(parse_cpu_list("0"), Some(1));
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("0-x"), None);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("1 (x) S 1 2").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_memory() {
        let status = "Name:\tagent\nVmSize:\t  20480 kB\nVmRSS:\t   4096 kB\nVmSwap:\t      8 kB\n";
        let mem = parse_memory(status).expect("memory");
        assert_eq!(mem.vmsize_kb, 20480);
        assert_eq!(mem.vmrss_kb, 4096);
        assert_eq!(mem.vmswap_kb, 8);
        assert!(parse_memory("Name:\tkthreadd\n").is_none());
    }

    #[test]
    fn test_cpu_load_pct() {
        assert!((cpu_load_pct(50, 100, 1.0) - 50.0).abs() < 1e-9);
        assert!((cpu_load_pct(400, 100, 2.0) - 200.0).abs() < 1e-9);
        assert_eq!(cpu_load_pct(10, 100, 0.0), 0.0);
    }

    #[test]
    fn test_sample_self() {
        let mut sampler = ProcSampler::new();
        let pid = std::process::id();
        let usage = sampler.sample(pid).expect("own process is readable");
        assert_eq!(usage.cpuload, 0.0);
        assert!(usage.vmrss_kb > 0);
        assert!(usage.fd_count > 0);
        assert!(sampler.sample(pid).is_some());
    }
}
