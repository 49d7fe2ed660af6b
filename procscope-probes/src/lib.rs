//! eBPF probes for procscope
//!
//! This crate contains the eBPF programs that run in kernel space:
//! - CPU-time aggregation over a bulk task walk (`iter/task`)
//! - Active-process tracking on every context switch (`tp_btf/sched_switch`)
//!
//! The probe logic itself lives in `procscope-common`; this crate only
//! adapts kernel maps, helpers and task memory to it.
//!
//! eBPF probe entry points are in src/bin/

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod maps;
pub mod task;

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
