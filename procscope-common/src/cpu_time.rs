//! CPU-Time Aggregator
//!
//! Runs once per task during a bulk `iter/task` pass and folds
//! `utime + stime` into a record keyed by the task's process-group identity.
//!
//! The counters reported for a task are already lifetime-cumulative, so a
//! second pass over an undrained map adds the whole usage again instead of a
//! delta. The reader drains the map before every pass; within one pass the
//! accumulation is what sums the threads of a process.

use crate::map::BoundedMap;
use crate::{ProcessInfo, TASK_COMM_LEN};

/// Read-only view of one task, as handed to the aggregator.
#[derive(Clone, Copy, Debug)]
pub struct TaskSample {
    pub tgid: i32,
    pub utime: u64,
    pub stime: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl TaskSample {
    #[inline(always)]
    pub fn cpu_time(&self) -> u64 {
        self.utime.wrapping_add(self.stime)
    }
}

/// Value shape stored by the aggregator.
///
/// Implemented by the minimal `u64` record and by [`ProcessInfo`]; both share
/// the same accumulation policy.
pub trait CpuTimeValue: Copy {
    /// Record for a process group seen for the first time.
    fn from_sample(task: &TaskSample) -> Self;

    /// Adds one task's sample to an existing record.
    fn accumulate(&mut self, sample: u64);
}

impl CpuTimeValue for u64 {
    #[inline(always)]
    fn from_sample(task: &TaskSample) -> Self {
        task.cpu_time()
    }

    #[inline(always)]
    fn accumulate(&mut self, sample: u64) {
        *self = self.wrapping_add(sample);
    }
}

impl CpuTimeValue for ProcessInfo {
    #[inline(always)]
    fn from_sample(task: &TaskSample) -> Self {
        ProcessInfo {
            cpu_time: task.cpu_time(),
            comm: task.comm,
        }
    }

    #[inline(always)]
    fn accumulate(&mut self, sample: u64) {
        self.cpu_time = self.cpu_time.wrapping_add(sample);
    }
}

/// Folds one task into `map`.
///
/// `None` is the end-of-iteration sentinel and leaves the map untouched.
/// A rejected insert (lost race against another CPU, or map full) is dropped.
#[inline(always)]
pub fn sum_cpu_time<V, M>(map: &M, task: Option<&TaskSample>)
where
    V: CpuTimeValue,
    M: BoundedMap<i32, V>,
{
    let Some(task) = task else {
        return;
    };

    let sample = task.cpu_time();
    if map.update_in_place(&task.tgid, |value| value.accumulate(sample)) {
        return;
    }

    let _ = map.insert_if_absent(&task.tgid, &V::from_sample(task));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMap;
    use crate::{comm_from_bytes, CPU_TIME_MAX_ENTRIES};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn task(tgid: i32, utime: u64, stime: u64, comm: &str) -> TaskSample {
        TaskSample {
            tgid,
            utime,
            stime,
            comm: comm_from_bytes(comm.as_bytes()),
        }
    }

    #[test]
    fn test_sentinel_is_noop() {
        let map: SimMap<i32, ProcessInfo> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        sum_cpu_time(&map, None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_new_key_records_sample_and_comm() {
        let map: SimMap<i32, ProcessInfo> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        sum_cpu_time(&map, Some(&task(100, 50, 30, "nginx")));

        let info = map.get(&100).unwrap();
        assert_eq!(info.cpu_time, 80);
        assert_eq!(info.comm, comm_from_bytes(b"nginx"));
    }

    #[test]
    fn test_second_pass_accumulates_instead_of_refreshing() {
        let map: SimMap<i32, ProcessInfo> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        let sample = task(100, 50, 30, "nginx");

        sum_cpu_time(&map, Some(&sample));
        assert_eq!(map.get(&100).unwrap().cpu_time, 80);

        sum_cpu_time(&map, Some(&sample));
        assert_eq!(map.get(&100).unwrap().cpu_time, 160);
    }

    #[test]
    fn test_threads_of_one_process_are_summed() {
        let map: SimMap<i32, ProcessInfo> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        sum_cpu_time(&map, Some(&task(7, 10, 5, "worker")));
        sum_cpu_time(&map, Some(&task(7, 20, 1, "worker-io")));

        let info = map.get(&7).unwrap();
        assert_eq!(info.cpu_time, 36);
        // The first task seen names the record.
        assert_eq!(info.comm, comm_from_bytes(b"worker"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_minimal_variant_shares_policy() {
        let map: SimMap<i32, u64> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        let sample = task(100, 50, 30, "nginx");
        sum_cpu_time(&map, Some(&sample));
        sum_cpu_time(&map, Some(&sample));
        assert_eq!(map.get(&100), Some(160));
    }

    #[test]
    fn test_full_map_rejects_new_keys_but_updates_existing() {
        let map: SimMap<i32, u64> = SimMap::new(CPU_TIME_MAX_ENTRIES);
        for tgid in 0..CPU_TIME_MAX_ENTRIES as i32 {
            sum_cpu_time(&map, Some(&task(tgid, 1, 0, "p")));
        }
        assert_eq!(map.len(), CPU_TIME_MAX_ENTRIES as usize);

        sum_cpu_time(&map, Some(&task(5000, 1, 1, "late")));
        assert_eq!(map.get(&5000), None);
        assert_eq!(map.len(), CPU_TIME_MAX_ENTRIES as usize);

        sum_cpu_time(&map, Some(&task(3, 10, 10, "p")));
        assert_eq!(map.get(&3), Some(21));
    }

    #[test]
    fn test_concurrent_increments_may_lose_an_update() {
        let original = 100u64;
        let map: Arc<SimMap<i32, u64>> = Arc::new(SimMap::new(CPU_TIME_MAX_ENTRIES));
        map.insert_if_absent(&1, &original).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [10u64, 20u64]
            .into_iter()
            .map(|delta| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    sum_cpu_time(&*map, Some(&task(1, delta, 0, "racer")));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let result = map.get(&1).unwrap();
        assert!(
            [original + 10, original + 20, original + 30].contains(&result),
            "unexpected total {}",
            result
        );
    }
}
