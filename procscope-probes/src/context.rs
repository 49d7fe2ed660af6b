//! Execution contexts

use core::ffi::c_void;

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_smp_processor_id},
    EbpfContext,
};
use procscope_common::{BpfIterTask, ExecContext, TASK_COMM_LEN};

/// Helpers of whichever program is currently running.
pub struct KernelContext;

impl ExecContext for KernelContext {
    #[inline(always)]
    fn current_comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN])
    }

    #[inline(always)]
    fn processor_id(&self) -> u32 {
        // SAFETY: always safe to call from eBPF context
        unsafe { bpf_get_smp_processor_id() }
    }
}

/// Context of an `iter/task` program.
pub struct IterTaskContext {
    ctx: *mut c_void,
}

impl IterTaskContext {
    pub fn new(ctx: *mut c_void) -> Self {
        Self { ctx }
    }

    /// Task of this step, or null at the end of the pass.
    #[inline(always)]
    pub fn task(&self) -> *const u8 {
        // SAFETY: the kernel passes a `struct bpf_iter__task`
        unsafe { (*(self.ctx as *const BpfIterTask)).task as *const u8 }
    }
}

impl EbpfContext for IterTaskContext {
    fn as_ptr(&self) -> *mut c_void {
        self.ctx
    }
}
