//! Active processes on isolated CPUs
//!
//! A process pinned to an isolated CPU may run for many windows without a
//! single context switch, so it never shows up in the active-process map
//! again after its first window. For each isolated CPU the tracker keeps the
//! processes of the last window with activity and reports those while the
//! CPU stays quiet.

use log::debug;
use std::collections::{BTreeMap, HashMap};

use crate::collector::ActiveProcess;

/// Which window `IsolatedTracker::active_procs` answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// The CPU switched tasks during the window just closed
    Current,
    /// No switch happened; the previous active set is still running
    Previous,
}

#[derive(Debug, Default)]
struct CpuWindow {
    current: BTreeMap<u32, ActiveProcess>,
    previous: BTreeMap<u32, ActiveProcess>,
}

/// Per-CPU current/previous active sets for isolated CPUs
#[derive(Debug, Default)]
pub struct IsolatedTracker {
    windows: BTreeMap<u32, CpuWindow>,
    /// pid -> CPU it was last tracked on
    owners: HashMap<u32, u32>,
}

impl IsolatedTracker {
    pub fn new(isolated: &[u32]) -> Self {
        Self {
            windows: isolated.iter().map(|&cpu| (cpu, CpuWindow::default())).collect(),
            owners: HashMap::new(),
        }
    }

    pub fn cpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.windows.keys().copied()
    }

    /// Record `proc` for the current window of its CPU.
    ///
    /// A process seen on a new CPU leaves the sets of the old one. Returns
    /// `false` (and records nothing) when the CPU is not isolated.
    pub fn track(&mut self, proc: ActiveProcess) -> bool {
        if !self.windows.contains_key(&proc.cpu) {
            return false;
        }
        if let Some(old) = self.owners.insert(proc.pid, proc.cpu) {
            if old != proc.cpu {
                debug!("pid {} moved from isolated cpu {} to {}", proc.pid, old, proc.cpu);
                if let Some(window) = self.windows.get_mut(&old) {
                    window.current.remove(&proc.pid);
                    window.previous.remove(&proc.pid);
                }
            }
        }
        if let Some(window) = self.windows.get_mut(&proc.cpu) {
            window.current.insert(proc.pid, proc);
        }
        true
    }

    /// Forget `pid` on every CPU, e.g. after it exited.
    pub fn remove(&mut self, pid: u32) {
        self.owners.remove(&pid);
        for window in self.windows.values_mut() {
            window.current.remove(&pid);
            window.previous.remove(&pid);
        }
    }

    /// Number of processes held across all isolated CPUs
    pub fn tracked(&self) -> usize {
        self.owners.len()
    }

    /// Close the window for `cpu` and return its active processes.
    ///
    /// With activity, the current set is returned and becomes the previous
    /// one. Without, the previous set is returned unchanged.
    pub fn active_procs(&mut self, cpu: u32) -> (Activity, Vec<ActiveProcess>) {
        let Some(window) = self.windows.get_mut(&cpu) else {
            return (Activity::Previous, Vec::new());
        };

        if window.current.is_empty() {
            debug!("isolated cpu {}: no switches, reusing previous window", cpu);
            return (Activity::Previous, window.previous.values().cloned().collect());
        }

        let dropped = std::mem::replace(&mut window.previous, std::mem::take(&mut window.current));
        for pid in dropped.keys() {
            if !window.previous.contains_key(pid) && self.owners.get(pid) == Some(&cpu) {
                self.owners.remove(pid);
            }
        }
        (Activity::Current, window.previous.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, cpu: u32) -> ActiveProcess {
        ActiveProcess {
            pid,
            cpu,
            comm: format!("task{}", pid),
        }
    }

    fn pids(procs: &[ActiveProcess]) -> Vec<u32> {
        procs.iter().map(|p| p.pid).collect()
    }

    #[test]
    fn test_track_only_isolated() {
        let mut tracker = IsolatedTracker::new(&[2, 3]);
        assert!(tracker.track(proc(10, 2)));
        assert!(!tracker.track(proc(11, 0)));
        assert_eq!(tracker.cpus().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn test_rotation() {
        let mut tracker = IsolatedTracker::new(&[2]);
        tracker.track(proc(10, 2));
        tracker.track(proc(11, 2));

        let (activity, procs) = tracker.active_procs(2);
        assert_eq!(activity, Activity::Current);
        assert_eq!(pids(&procs), vec![10, 11]);

        // quiet window: the same processes are still running
        let (activity, procs) = tracker.active_procs(2);
        assert_eq!(activity, Activity::Previous);
        assert_eq!(pids(&procs), vec![10, 11]);

        // new activity replaces the previous set
        tracker.track(proc(12, 2));
        let (activity, procs) = tracker.active_procs(2);
        assert_eq!(activity, Activity::Current);
        assert_eq!(pids(&procs), vec![12]);
    }

    #[test]
    fn test_never_active_cpu_is_empty() {
        let mut tracker = IsolatedTracker::new(&[5]);
        let (activity, procs) = tracker.active_procs(5);
        assert_eq!(activity, Activity::Previous);
        assert!(procs.is_empty());

        let (_, procs) = tracker.active_procs(9);
        assert!(procs.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut tracker = IsolatedTracker::new(&[2]);
        tracker.track(proc(10, 2));
        tracker.track(proc(11, 2));
        tracker.active_procs(2);

        tracker.remove(10);
        tracker.remove(99);
        let (activity, procs) = tracker.active_procs(2);
        assert_eq!(activity, Activity::Previous);
        assert_eq!(pids(&procs), vec![11]);
    }

    #[test]
    fn test_migrated_process_is_removed_everywhere() {
        let mut tracker = IsolatedTracker::new(&[2, 3]);
        tracker.track(proc(10, 2));
        tracker.active_procs(2);
        tracker.active_procs(3);

        // the process now runs on cpu 3; cpu 2 stays quiet
        tracker.track(proc(10, 3));
        let (_, procs) = tracker.active_procs(3);
        assert_eq!(pids(&procs), vec![10]);
        let (activity, procs) = tracker.active_procs(2);
        assert_eq!(activity, Activity::Previous);
        assert!(procs.is_empty());

        tracker.remove(10);
        assert!(tracker.active_procs(2).1.is_empty());
        assert!(tracker.active_procs(3).1.is_empty());
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn test_rotation_forgets_dropped_processes() {
        let mut tracker = IsolatedTracker::new(&[2]);
        tracker.track(proc(10, 2));
        tracker.track(proc(11, 2));
        tracker.active_procs(2);
        assert_eq!(tracker.tracked(), 2);

        tracker.track(proc(11, 2));
        tracker.active_procs(2);
        assert_eq!(tracker.tracked(), 1);
        tracker.active_procs(2);
        assert_eq!(tracker.tracked(), 1);
    }
}
