//! Active-process probe on every context switch
//!
//! `tp_btf/sched_switch` receives `(preempt, prev, next, prev_state)`; both
//! task pointers are passed to the tracker, outgoing first.

#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_long,
    macros::{btf_tracepoint, map},
    maps::HashMap,
    programs::BtfTracePointContext,
};
use aya_log_ebpf::debug;
use procscope_common::{active, ActiveProc, ACTIVE_PROCS_MAX_ENTRIES};
use procscope_probes::{context::KernelContext, maps::KernelMap, task::read_ids};

#[map]
static ACTIVE_PROCS: HashMap<u32, ActiveProc> =
    HashMap::with_max_entries(ACTIVE_PROCS_MAX_ENTRIES, 0);

#[btf_tracepoint(function = "sched_switch")]
pub fn handle_sched_switch(ctx: BtfTracePointContext) -> i32 {
    match unsafe { try_handle_sched_switch(&ctx) } {
        Ok(()) => 0,
        Err(ret) => {
            debug!(&ctx, "failed to read switching tasks: {}", ret);
            0
        }
    }
}

unsafe fn try_handle_sched_switch(ctx: &BtfTracePointContext) -> Result<(), c_long> {
    let prev: *const u8 = ctx.arg(1);
    let next: *const u8 = ctx.arg(2);

    let prev = read_ids(prev)?;
    let next = read_ids(next)?;

    active::handle_sched_switch(&KernelContext, &KernelMap(&ACTIVE_PROCS), prev, next);
    Ok(())
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
