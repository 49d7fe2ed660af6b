//! Sampling windows over the probe maps
//!
//! The probes only ever add to their maps. One sampling window is defined
//! by draining a map: snapshot every entry, then delete it. Deltas between
//! consecutive windows are computed here.

use anyhow::Result;
use log::debug;
use procscope_common::{comm_to_string, sim::SimMap, ActiveProc, ProcessInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;

use crate::procstat::ProcFs;

const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// A map that can be read and cleared from userspace
pub trait WindowMap<K, V> {
    /// Every entry currently in the map
    fn entries(&self) -> Result<Vec<(K, V)>>;

    /// Delete `key`. A key that is already gone is not an error.
    fn delete(&mut self, key: &K) -> Result<()>;
}

/// Snapshot every entry of `map`, then delete it.
///
/// Entries inserted between the snapshot and the deletes survive into the
/// next window.
pub fn drain<K, V, M>(map: &mut M) -> Result<Vec<(K, V)>>
where
    M: WindowMap<K, V>,
{
    let entries = map.entries()?;
    for (key, _) in &entries {
        map.delete(key)?;
    }
    Ok(entries)
}

/// One process's accumulated CPU time, as read from a CPU-time map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSample {
    pub pid: u32,
    /// `utime + stime` summed over the process's threads, in nanoseconds
    pub cpu_time_ns: u64,
    /// `None` for the minimal variant
    pub comm: Option<String>,
}

/// Values of either CPU-time map
pub trait IntoCpuSample {
    fn into_sample(self, pid: i32) -> CpuSample;
}

impl IntoCpuSample for ProcessInfo {
    fn into_sample(self, pid: i32) -> CpuSample {
        CpuSample {
            pid: pid as u32,
            cpu_time_ns: self.cpu_time,
            comm: Some(comm_to_string(&self.comm)),
        }
    }
}

impl IntoCpuSample for u64 {
    fn into_sample(self, pid: i32) -> CpuSample {
        CpuSample {
            pid: pid as u32,
            cpu_time_ns: self,
            comm: None,
        }
    }
}

/// Drain a CPU-time map (either variant) into samples
pub fn drain_cpu_time<V, M>(map: &mut M) -> Result<Vec<CpuSample>>
where
    V: IntoCpuSample,
    M: WindowMap<i32, V>,
{
    Ok(drain(map)?
        .into_iter()
        .map(|(pid, value)| value.into_sample(pid))
        .collect())
}

/// A process seen on a CPU during the window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveProcess {
    pub pid: u32,
    pub cpu: u32,
    pub comm: String,
}

impl From<ActiveProc> for ActiveProcess {
    fn from(proc: ActiveProc) -> Self {
        Self {
            pid: proc.pid,
            cpu: proc.cpu as u32,
            comm: comm_to_string(&proc.comm),
        }
    }
}

/// Drain the active-process map, ordered by pid
pub fn drain_active_procs<M>(map: &mut M) -> Result<Vec<ActiveProcess>>
where
    M: WindowMap<u32, ActiveProc>,
{
    let mut procs: Vec<ActiveProcess> = drain(map)?
        .into_iter()
        .map(|(_, proc)| ActiveProcess::from(proc))
        .collect();
    procs.sort_by_key(|p| p.pid);
    Ok(procs)
}

/// CPU usage of one process over a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    /// CPU seconds spent during the window; 0 on first sight
    pub cpu_delta_secs: f64,
    /// CPU seconds since the process started
    pub total_secs: f64,
    pub comm: String,
    pub executable: String,
}

/// Turns drained CPU-time samples into per-window usage
pub struct CpuTimeCollector {
    procfs: ProcFs,
    previous: HashMap<u32, u64>,
}

impl Default for CpuTimeCollector {
    fn default() -> Self {
        Self::new(ProcFs::new())
    }
}

impl CpuTimeCollector {
    pub fn new(procfs: ProcFs) -> Self {
        Self {
            procfs,
            previous: HashMap::new(),
        }
    }

    /// Run one iteration pass and turn the drained map into usage
    #[cfg(target_os = "linux")]
    pub fn collect(
        &mut self,
        probes: &mut crate::probe_loader::ProbeManager,
    ) -> Result<Vec<ProcessUsage>> {
        probes.run_iteration()?;
        let samples = probes.drain_cpu_time()?;
        Ok(self.window(samples))
    }

    /// Compute usage against the previous window and remember this one.
    ///
    /// Processes absent from this window are forgotten. Results are sorted
    /// by delta, highest first.
    pub fn window(&mut self, samples: Vec<CpuSample>) -> Vec<ProcessUsage> {
        let mut usage: Vec<ProcessUsage> = samples
            .iter()
            .map(|sample| {
                let delta_ns = self
                    .previous
                    .get(&sample.pid)
                    .map(|prev| sample.cpu_time_ns.saturating_sub(*prev))
                    .unwrap_or(0);
                let comm = sample
                    .comm
                    .clone()
                    .or_else(|| self.procfs.read_comm(sample.pid))
                    .unwrap_or_default();

                ProcessUsage {
                    pid: sample.pid,
                    cpu_delta_secs: delta_ns as f64 / NSEC_PER_SEC,
                    total_secs: sample.cpu_time_ns as f64 / NSEC_PER_SEC,
                    comm,
                    executable: self.procfs.executable(sample.pid),
                }
            })
            .collect();

        let before = self.previous.len();
        self.previous = samples.iter().map(|s| (s.pid, s.cpu_time_ns)).collect();
        debug!(
            "CPU window: {} processes (previous window had {})",
            self.previous.len(),
            before
        );

        usage.sort_by(|a, b| {
            b.cpu_delta_secs
                .total_cmp(&a.cpu_delta_secs)
                .then(a.pid.cmp(&b.pid))
        });
        usage
    }
}

impl<K, V> WindowMap<K, V> for SimMap<K, V>
where
    K: Eq + Hash + Ord + Copy,
    V: Copy,
{
    fn entries(&self) -> Result<Vec<(K, V)>> {
        Ok(self.snapshot().into_iter().collect())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod kernel {
    use super::WindowMap;
    use anyhow::{Context, Result};
    use aya::{
        maps::{HashMap, MapData, MapError},
        Pod,
    };
    use std::borrow::BorrowMut;

    impl<T, K, V> WindowMap<K, V> for HashMap<T, K, V>
    where
        T: BorrowMut<MapData>,
        K: Pod,
        V: Pod,
    {
        fn entries(&self) -> Result<Vec<(K, V)>> {
            self.iter()
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to iterate eBPF map")
        }

        fn delete(&mut self, key: &K) -> Result<()> {
            match self.remove(key) {
                Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
                Err(e) => Err(e).context("Failed to delete eBPF map entry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procstat::tests::stat_line;
    use procscope_common::{comm_from_bytes, BoundedMap, CPU_TIME_MAX_ENTRIES};
    use std::path::Path;
    use tempfile::TempDir;

    fn empty_procfs() -> (TempDir, ProcFs) {
        let dir = TempDir::new().unwrap();
        let procfs = ProcFs::with_roots(dir.path().to_path_buf(), dir.path().to_path_buf());
        (dir, procfs)
    }

    fn sample(pid: u32, secs: u64, comm: &str) -> CpuSample {
        CpuSample {
            pid,
            cpu_time_ns: secs * 1_000_000_000,
            comm: Some(comm.to_string()),
        }
    }

    #[test]
    fn test_drain_empties_map() {
        let mut map: SimMap<i32, u64> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        map.insert_if_absent(&7, &70).unwrap();
        map.insert_if_absent(&3, &30).unwrap();

        let entries = drain(&mut map).unwrap();
        assert_eq!(entries, vec![(3, 30), (7, 70)]);
        assert!(map.is_empty());
        assert!(drain(&mut map).unwrap().is_empty());
    }

    #[test]
    fn test_drain_cpu_time_variants() {
        let mut full: SimMap<i32, ProcessInfo> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        full.insert_if_absent(
            &100,
            &ProcessInfo {
                cpu_time: 80,
                comm: comm_from_bytes(b"bash"),
            },
        )
        .unwrap();
        let samples = drain_cpu_time(&mut full).unwrap();
        assert_eq!(
            samples,
            vec![CpuSample {
                pid: 100,
                cpu_time_ns: 80,
                comm: Some("bash".to_string()),
            }]
        );

        let mut minimal: SimMap<i32, u64> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        minimal.insert_if_absent(&100, &80).unwrap();
        let samples = drain_cpu_time(&mut minimal).unwrap();
        assert_eq!(samples[0].comm, None);
    }

    #[test]
    fn test_drain_active_procs_sorted() {
        let mut map: SimMap<u32, ActiveProc> = SimMap::new(16);
        for (pid, cpu, name) in [(42u32, 3, "redis"), (7, 0, "sshd")] {
            map.insert_if_absent(
                &pid,
                &ActiveProc {
                    pid,
                    cpu,
                    comm: comm_from_bytes(name.as_bytes()),
                },
            )
            .unwrap();
        }

        let procs = drain_active_procs(&mut map).unwrap();
        assert_eq!(
            procs,
            vec![
                ActiveProcess {
                    pid: 7,
                    cpu: 0,
                    comm: "sshd".to_string()
                },
                ActiveProcess {
                    pid: 42,
                    cpu: 3,
                    comm: "redis".to_string()
                },
            ]
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_first_window_has_zero_delta() {
        let (_dir, procfs) = empty_procfs();
        let mut collector = CpuTimeCollector::new(procfs);

        let usage = collector.window(vec![sample(1, 5, "init")]);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].cpu_delta_secs, 0.0);
        assert_eq!(usage[0].total_secs, 5.0);
        assert_eq!(usage[0].executable, "");
    }

    #[test]
    fn test_window_deltas_sorted_descending() {
        let (_dir, procfs) = empty_procfs();
        let mut collector = CpuTimeCollector::new(procfs);
        collector.window(vec![sample(1, 10, "a"), sample(2, 10, "b"), sample(3, 10, "c")]);

        let usage =
            collector.window(vec![sample(1, 11, "a"), sample(2, 14, "b"), sample(3, 12, "c")]);
        let order: Vec<u32> = usage.iter().map(|u| u.pid).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(usage[0].cpu_delta_secs, 4.0);
        assert_eq!(usage[0].total_secs, 14.0);
    }

    #[test]
    fn test_window_forgets_missing_and_handles_pid_reuse() {
        let (_dir, procfs) = empty_procfs();
        let mut collector = CpuTimeCollector::new(procfs);
        collector.window(vec![sample(1, 10, "old"), sample(2, 10, "b")]);
        collector.window(vec![sample(2, 11, "b")]);

        // pid 1 was forgotten, so it starts over
        let usage = collector.window(vec![sample(1, 3, "new")]);
        assert_eq!(usage[0].cpu_delta_secs, 0.0);

        // a reused pid with a smaller counter never goes negative
        collector.window(vec![sample(5, 20, "x")]);
        let usage = collector.window(vec![sample(5, 2, "y")]);
        assert_eq!(usage[0].cpu_delta_secs, 0.0);
    }

    #[test]
    fn test_minimal_variant_comm_from_procfs() {
        let dir = TempDir::new().unwrap();
        let write = |rel: &str, content: &str| {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        };
        write("55/stat", &stat_line(55, "postgres"));
        let exe = Path::new(dir.path()).join("55/exe");
        std::os::unix::fs::symlink("/usr/bin/postgres", exe).unwrap();

        let procfs = ProcFs::with_roots(dir.path().to_path_buf(), dir.path().to_path_buf());
        let mut collector = CpuTimeCollector::new(procfs);
        let usage = collector.window(vec![
            CpuSample {
                pid: 55,
                cpu_time_ns: 1_500_000_000,
                comm: None,
            },
            CpuSample {
                pid: 56,
                cpu_time_ns: 1,
                comm: None,
            },
        ]);

        let pg = usage.iter().find(|u| u.pid == 55).unwrap();
        assert_eq!(pg.comm, "postgres");
        assert_eq!(pg.executable, "/usr/bin/postgres");
        assert_eq!(pg.total_secs, 1.5);
        let gone = usage.iter().find(|u| u.pid == 56).unwrap();
        assert_eq!(gone.comm, "");
    }
}
