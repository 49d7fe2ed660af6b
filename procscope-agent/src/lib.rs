//! Userspace side of procscope: loads the probes and reads their maps.
//!
//! - [`btf`]: `task_struct` offsets from kernel BTF
//! - [`probe_loader`]: load, attach and iterate (Linux only)
//! - [`collector`]: drain maps into sampling windows and compute deltas
//! - [`procstat`]: `/proc/<pid>/stat` and isolated CPU lists
//! - [`isolated`]: per-CPU active sets for isolated CPUs

pub mod btf;
pub mod collector;
pub mod isolated;
#[cfg(target_os = "linux")]
pub mod probe_loader;
pub mod procstat;

pub use collector::{ActiveProcess, CpuSample, CpuTimeCollector, ProcessUsage};
pub use isolated::{Activity, IsolatedTracker};
#[cfg(target_os = "linux")]
pub use probe_loader::{CpuTimeVariant, ProbeManager};
pub use procstat::{PidStat, ProcFs, StatScan};
