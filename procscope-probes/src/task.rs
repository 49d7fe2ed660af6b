//! Reading `struct task_struct` fields through runtime offsets
//!
//! Offsets differ between kernel builds. Userspace resolves them from BTF
//! and writes them into `TASK_OFFSETS` before loading, so field reads go
//! through `bpf_probe_read_kernel` at `task + offset`.

use aya_ebpf::{cty::c_long, helpers::bpf_probe_read_kernel};
use procscope_common::{TaskIds, TaskOffsets, TaskSample, TASK_COMM_LEN};

#[no_mangle]
static TASK_OFFSETS: TaskOffsets = TaskOffsets::zeroed();

#[inline(always)]
fn offsets() -> TaskOffsets {
    // SAFETY: plain read of a global; volatile keeps the loader-patched value
    // from being folded to the zeroed initializer.
    unsafe { core::ptr::read_volatile(&TASK_OFFSETS) }
}

#[inline(always)]
unsafe fn read_field<T>(task: *const u8, offset: u32) -> Result<T, c_long> {
    bpf_probe_read_kernel(task.add(offset as usize) as *const T)
}

/// Reads the aggregator's view of `task`.
///
/// # Safety
///
/// `task` must point to a live `task_struct`.
#[inline(always)]
pub unsafe fn read_sample(task: *const u8) -> Result<TaskSample, c_long> {
    let off = offsets();
    Ok(TaskSample {
        tgid: read_field::<i32>(task, off.tgid)?,
        utime: read_field::<u64>(task, off.utime)?,
        stime: read_field::<u64>(task, off.stime)?,
        comm: read_field::<[u8; TASK_COMM_LEN]>(task, off.comm)?,
    })
}

/// Reads the thread id and process-group identity of `task`.
///
/// # Safety
///
/// `task` must point to a live `task_struct`.
#[inline(always)]
pub unsafe fn read_ids(task: *const u8) -> Result<TaskIds, c_long> {
    let off = offsets();
    Ok(TaskIds {
        pid: read_field::<i32>(task, off.pid)? as u32,
        tgid: read_field::<i32>(task, off.tgid)? as u32,
    })
}
