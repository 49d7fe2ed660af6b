//! `/proc` and `/sys` readers
//!
//! The active-process view only names processes; their CPU counters come
//! from `/proc/<pid>/stat`. Command names for the minimal CPU-time variant
//! and executable paths come from here too.

use anyhow::{anyhow, Context, Result};
use log::debug;
use procfs::process::{all_processes_with_root, Process};
use std::fs;
use std::path::PathBuf;

const PROC_ROOT: &str = "/proc";
const SYS_ROOT: &str = "/sys";

/// Path of the isolated CPU list, relative to the sysfs root.
const ISOLATED_CPUS: &str = "devices/system/cpu/isolated";

/// CPU counters of one process, in clock ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStat {
    pub pid: u32,
    pub comm: String,
    pub utime: u64,
    pub stime: u64,
}

/// One pass over every process in the procfs root
#[derive(Debug, Default)]
pub struct StatScan {
    pub stats: Vec<PidStat>,
    /// Pids listed in the root whose stat could not be read
    pub failed: Vec<u32>,
}

/// Reader over a procfs/sysfs pair
pub struct ProcFs {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
            sys_root: PathBuf::from(SYS_ROOT),
        }
    }

    /// Create a reader over custom roots (for testing)
    pub fn with_roots(proc_root: PathBuf, sys_root: PathBuf) -> Self {
        Self {
            proc_root,
            sys_root,
        }
    }

    fn process(&self, pid: u32) -> Result<Process> {
        let path = self.proc_root.join(pid.to_string());
        Process::new_with_root(path.clone())
            .with_context(|| format!("Failed to open {}", path.display()))
    }

    /// Read `utime`, `stime` and the command name from `/proc/<pid>/stat`
    pub fn read_pid_stat(&self, pid: u32) -> Result<PidStat> {
        let stat = self.process(pid)?.stat().with_context(|| {
            format!("Failed to read {}/{}/stat", self.proc_root.display(), pid)
        })?;

        Ok(PidStat {
            pid,
            comm: stat.comm,
            utime: stat.utime,
            stime: stat.stime,
        })
    }

    /// Command name of `pid`, `None` once it has exited
    pub fn read_comm(&self, pid: u32) -> Option<String> {
        self.read_pid_stat(pid).ok().map(|stat| stat.comm)
    }

    /// Target of `/proc/<pid>/exe`, or an empty string when unreadable
    /// (kernel threads, exited processes, missing permissions).
    pub fn executable(&self, pid: u32) -> String {
        match self.process(pid).and_then(|p| p.exe().map_err(anyhow::Error::from)) {
            Ok(exe) => exe.to_string_lossy().into_owned(),
            Err(e) => {
                debug!("Cannot read exe of {}: {:#}", pid, e);
                String::new()
            }
        }
    }

    /// Pids of the procfs root, ascending
    pub fn pids(&self) -> Result<Vec<u32>> {
        let processes = all_processes_with_root(&self.proc_root)
            .with_context(|| format!("Failed to read {}", self.proc_root.display()))?;

        let mut pids: Vec<u32> = processes
            .filter_map(|process| process.ok())
            .filter_map(|process| u32::try_from(process.pid).ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Read the stat of every process once.
    ///
    /// Processes that exit between the listing and the read land in
    /// `failed`; they do not abort the scan.
    pub fn scan(&self) -> Result<StatScan> {
        let mut scan = StatScan::default();
        for pid in self.pids()? {
            match self.read_pid_stat(pid) {
                Ok(stat) => scan.stats.push(stat),
                Err(e) => {
                    debug!("{:#}", e);
                    scan.failed.push(pid);
                }
            }
        }
        Ok(scan)
    }

    /// Isolated CPUs from `/sys/devices/system/cpu/isolated`
    pub fn read_isolated_cpus(&self) -> Result<Vec<u32>> {
        let path = self.sys_root.join(ISOLATED_CPUS);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read isolated CPUs from {}", path.display()))?;
        parse_isolated_cpus(content.trim())
    }
}

/// Parse a CPU list such as `0-2,5`
///
/// An empty list means no isolated CPUs. Ranges must be strictly
/// increasing, so `3-3` and `4-2` are rejected.
pub fn parse_isolated_cpus(list: &str) -> Result<Vec<u32>> {
    if list.is_empty() {
        return Ok(Vec::new());
    }

    let mut cpus = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((begin, end)) => {
                let invalid = || anyhow!("Invalid range {}", part);
                let begin: u32 = begin.parse().map_err(|_| invalid())?;
                let end: u32 = end.parse().map_err(|_| invalid())?;
                if begin >= end {
                    return Err(invalid());
                }
                cpus.extend(begin..=end);
            }
            None => {
                let cpu = part.parse().map_err(|_| anyhow!("Invalid cpu {}", part))?;
                cpus.push(cpu);
            }
        }
    }
    Ok(cpus)
}

/// Clock ticks per second, the unit of `/proc/<pid>/stat` CPU times
pub fn clock_ticks() -> u64 {
    procfs::ticks_per_second()
}
