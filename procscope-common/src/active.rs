//! Active-Process Tracker
//!
//! Invoked on every `sched_switch`, once for the outgoing task and once for
//! the incoming one. Each process group is recorded the first time it is
//! seen; later switches never refresh the record, so the map is "every
//! process group observed since the reader last cleared it".

use crate::map::BoundedMap;
use crate::{ActiveProc, KWORKER_PREFIX, TASK_COMM_LEN};

/// Execution context a probe runs in.
pub trait ExecContext {
    /// Command name of whatever task the helper considers current.
    ///
    /// At a switch boundary this is not necessarily the task whose
    /// identity is being recorded.
    fn current_comm(&self) -> [u8; TASK_COMM_LEN];

    /// Index of the CPU executing the probe.
    fn processor_id(&self) -> u32;
}

/// Thread id and process-group identity of one side of a context switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskIds {
    pub pid: u32,
    pub tgid: u32,
}

#[inline(always)]
pub fn is_kworker(comm: &[u8; TASK_COMM_LEN]) -> bool {
    comm.starts_with(KWORKER_PREFIX)
}

/// Records `tgid` unless it is the idle task or a kernel worker.
///
/// Insertion is accept-once: an existing record for `tgid` is left as is.
#[inline(always)]
pub fn do_update<C, M>(ctx: &C, map: &M, pid: u32, tgid: u32)
where
    C: ExecContext,
    M: BoundedMap<u32, ActiveProc>,
{
    if pid == 0 {
        return;
    }

    let comm = ctx.current_comm();
    if is_kworker(&comm) {
        return;
    }

    let info = ActiveProc {
        pid: tgid,
        cpu: ctx.processor_id() as i32,
        comm,
    };
    let _ = map.insert_if_absent(&tgid, &info);
}

/// Handles one context switch: the outgoing task first, then the incoming.
#[inline(always)]
pub fn handle_sched_switch<C, M>(ctx: &C, map: &M, prev: TaskIds, next: TaskIds)
where
    C: ExecContext,
    M: BoundedMap<u32, ActiveProc>,
{
    do_update(ctx, map, prev.pid, prev.tgid);
    do_update(ctx, map, next.pid, next.tgid);
}
