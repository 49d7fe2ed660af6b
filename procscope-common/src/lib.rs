//! Shared types between eBPF (kernel) and userspace
//!
//! This crate defines the map records and the probe logic that must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between kernel probes and the userspace reader
//!
//! The probe algorithms live here as plain generic functions over
//! [`BoundedMap`] and [`ExecContext`], so the same code runs inside the
//! kernel and inside unit tests.

#![cfg_attr(not(feature = "userspace"), no_std)]

pub mod active;
pub mod cpu_time;
pub mod map;
#[cfg(feature = "userspace")]
pub mod sim;

pub use active::{do_update, handle_sched_switch, is_kworker, ExecContext, TaskIds};
pub use cpu_time::{sum_cpu_time, CpuTimeValue, TaskSample};
pub use map::{BoundedMap, InsertError};

/// Length of `task_struct::comm`, including the (optional) NUL terminator.
pub const TASK_COMM_LEN: usize = 16;

/// Capacity of the CPU-time maps (both variants).
pub const CPU_TIME_MAX_ENTRIES: u32 = 1024;

/// Capacity of the active-process map.
pub const ACTIVE_PROCS_MAX_ENTRIES: u32 = 8192;

/// Command-name prefix of kernel worker threads, which are never tracked.
pub const KWORKER_PREFIX: &[u8] = b"kworker";

/// Map and program names shared by the probes and the loader.
pub mod names {
    pub const PROCESS_MAP: &str = "PROCESS_MAP";
    pub const CPU_TIME_MAP: &str = "CPU_TIME_MAP";
    pub const ACTIVE_PROCS: &str = "ACTIVE_PROCS";
    pub const TASK_OFFSETS: &str = "TASK_OFFSETS";

    pub const SUM_CPU_TIME: &str = "sum_cpu_time";
    pub const SUM_CPU_TICKS: &str = "sum_cpu_ticks";
    pub const HANDLE_SCHED_SWITCH: &str = "handle_sched_switch";

    pub const CPU_TIME_OBJECT: &str = "cpu_time";
    pub const ACTIVE_PROCS_OBJECT: &str = "active_procs";
}

/// Per-process CPU time record stored in `PROCESS_MAP`
///
/// Layout (24 bytes total, 8-byte aligned):
/// - cpu_time: `utime + stime` accumulated over every task of the process
/// - comm: command name of the first task seen, not necessarily NUL-terminated
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct ProcessInfo {
    pub cpu_time: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Record stored in `ACTIVE_PROCS`
///
/// Layout (24 bytes total, 4-byte aligned):
/// - pid: the process-group identity (tgid), the same value as the map key
/// - cpu: processor the process was first observed on
/// - comm: command name read at the time of the first observation
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct ActiveProc {
    pub pid: u32,
    pub cpu: i32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Byte offsets into the running kernel's `struct task_struct`.
///
/// Rust eBPF programs have no CO-RE relocations, so userspace resolves these
/// from `/sys/kernel/btf/vmlinux` and writes them into the `TASK_OFFSETS`
/// global before the programs are loaded.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct TaskOffsets {
    pub pid: u32,
    pub tgid: u32,
    pub utime: u32,
    pub stime: u32,
    pub comm: u32,
    pub _padding: u32,
}

impl TaskOffsets {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            tgid: 0,
            utime: 0,
            stime: 0,
            comm: 0,
            _padding: 0,
        }
    }

    /// All offsets resolved. `pid` sits well past the start of
    /// `task_struct`, so zero means "never set".
    pub const fn is_resolved(&self) -> bool {
        self.pid != 0 && self.tgid != 0 && self.utime != 0 && self.stime != 0 && self.comm != 0
    }
}

/// Context of an `iter/task` program (`struct bpf_iter__task`).
///
/// Both fields are unions of a single pointer in the kernel, so each one
/// occupies exactly 8 bytes. `task` is null on the final call of a pass.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BpfIterTask {
    pub meta: u64,
    pub task: u64,
}

/// Length of a command name up to its first NUL (or the full buffer).
pub fn comm_len(comm: &[u8]) -> usize {
    comm.iter().position(|&b| b == 0).unwrap_or(comm.len())
}

/// Command name as text, trimmed at the first NUL byte.
#[cfg(feature = "userspace")]
pub fn comm_to_string(comm: &[u8]) -> String {
    String::from_utf8_lossy(&comm[..comm_len(comm)]).into_owned()
}

/// Builds a command-name buffer, truncating to [`TASK_COMM_LEN`] bytes.
pub fn comm_from_bytes(name: &[u8]) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    let len = name.len().min(TASK_COMM_LEN);
    comm[..len].copy_from_slice(&name[..len]);
    comm
}

#[cfg(all(feature = "userspace", target_os = "linux"))]
mod pod {
    use super::{ActiveProc, ProcessInfo, TaskOffsets};

    // SAFETY: plain `#[repr(C)]` integers and byte arrays with no padding.
    unsafe impl aya::Pod for ProcessInfo {}
    unsafe impl aya::Pod for ActiveProc {}
    unsafe impl aya::Pod for TaskOffsets {}
}

const _: () = {
    assert!(
        core::mem::size_of::<ProcessInfo>() == 24,
        "ProcessInfo must be exactly 24 bytes"
    );
    assert!(
        core::mem::align_of::<ProcessInfo>() == 8,
        "ProcessInfo must be 8-byte aligned"
    );
    assert!(
        core::mem::size_of::<ActiveProc>() == 24,
        "ActiveProc must be exactly 24 bytes"
    );
    assert!(
        core::mem::align_of::<ActiveProc>() == 4,
        "ActiveProc must be 4-byte aligned"
    );
    assert!(
        core::mem::size_of::<TaskOffsets>() == 24,
        "TaskOffsets must be exactly 24 bytes"
    );
    assert!(
        core::mem::size_of::<BpfIterTask>() == 16,
        "BpfIterTask must be exactly 16 bytes"
    );
};
