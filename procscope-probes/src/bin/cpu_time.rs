//! CPU-time probe driven by a bulk task walk
//!
//! Two `iter/task` programs, one per record shape:
//! - `sum_cpu_time` fills `PROCESS_MAP` (cpu time + command name)
//! - `sum_cpu_ticks` fills `CPU_TIME_MAP` (cpu time only)
//!
//! Userspace triggers a pass by reading an iterator created from the
//! program's link; every task in the system is visited once, followed by a
//! final call with a null task.

#![no_std]
#![no_main]

use core::ffi::c_void;

use aya_ebpf::{cty::c_long, macros::map, maps::HashMap};
use aya_log_ebpf::debug;
use procscope_common::{sum_cpu_time as fold_task, CpuTimeValue, ProcessInfo, CPU_TIME_MAX_ENTRIES};
use procscope_probes::{context::IterTaskContext, maps::KernelMap, task::read_sample};

#[map]
static PROCESS_MAP: HashMap<i32, ProcessInfo> = HashMap::with_max_entries(CPU_TIME_MAX_ENTRIES, 0);

#[map]
static CPU_TIME_MAP: HashMap<i32, u64> = HashMap::with_max_entries(CPU_TIME_MAX_ENTRIES, 0);

#[no_mangle]
#[link_section = "iter/task"]
pub extern "C" fn sum_cpu_time(ctx: *mut c_void) -> u32 {
    let ctx = IterTaskContext::new(ctx);
    match try_sum(&ctx, &PROCESS_MAP) {
        Ok(()) => 0,
        Err(ret) => {
            debug!(&ctx, "failed to read task: {}", ret);
            0
        }
    }
}

#[no_mangle]
#[link_section = "iter/task"]
pub extern "C" fn sum_cpu_ticks(ctx: *mut c_void) -> u32 {
    let ctx = IterTaskContext::new(ctx);
    match try_sum(&ctx, &CPU_TIME_MAP) {
        Ok(()) => 0,
        Err(ret) => {
            debug!(&ctx, "failed to read task: {}", ret);
            0
        }
    }
}

#[inline(always)]
fn try_sum<V: CpuTimeValue>(ctx: &IterTaskContext, map: &HashMap<i32, V>) -> Result<(), c_long> {
    let task = ctx.task();
    if task.is_null() {
        fold_task(&KernelMap(map), None);
        return Ok(());
    }

    // SAFETY: non-null tasks handed to iter/task are live for this call
    let sample = unsafe { read_sample(task)? };
    fold_task(&KernelMap(map), Some(&sample));
    Ok(())
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
