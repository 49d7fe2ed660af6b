//! eBPF probe loader and lifecycle management

use anyhow::{anyhow, Context, Result};
use aya::{
    include_bytes_aligned,
    maps::{HashMap, Map},
    programs::{BtfTracePoint, Iter},
    Btf, Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use procscope_common::{names, ActiveProc, ProcessInfo, TaskOffsets};
use std::io::Read;
use std::path::Path;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::btf::VMLINUX_BTF;
use crate::collector::{self, ActiveProcess, CpuSample};

/// Oldest kernel with both `iter/task` and `tp_btf` programs
const MIN_KERNEL: (u32, u32) = (5, 8);

static CPU_TIME_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/cpu_time"));
static ACTIVE_PROCS_OBJECT: &[u8] =
    include_bytes_aligned!(concat!(env!("OUT_DIR"), "/active_procs"));

/// Which CPU-time record shape to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuTimeVariant {
    /// `PROCESS_MAP`: CPU time plus command name
    WithComm,
    /// `CPU_TIME_MAP`: CPU time only
    Minimal,
}

impl CpuTimeVariant {
    pub fn program(self) -> &'static str {
        match self {
            Self::WithComm => names::SUM_CPU_TIME,
            Self::Minimal => names::SUM_CPU_TICKS,
        }
    }

    pub fn map(self) -> &'static str {
        match self {
            Self::WithComm => names::PROCESS_MAP,
            Self::Minimal => names::CPU_TIME_MAP,
        }
    }
}

/// Manages eBPF probe lifecycle
pub struct ProbeManager {
    cpu_time: Ebpf,
    active_procs: Ebpf,
    btf: Btf,
    variant: Option<CpuTimeVariant>,
}

impl ProbeManager {
    /// Run pre-flight checks and load both probe objects with `offsets`
    pub fn new(offsets: TaskOffsets) -> Result<Self> {
        run_preflight_checks()?;
        if !offsets.is_resolved() {
            return Err(anyhow!("task_struct offsets are not resolved: {:?}", offsets));
        }
        bump_memlock_rlimit();

        info!("Loading probes...");
        let mut cpu_time = load_object(names::CPU_TIME_OBJECT, CPU_TIME_OBJECT, &offsets)?;
        let mut active_procs =
            load_object(names::ACTIVE_PROCS_OBJECT, ACTIVE_PROCS_OBJECT, &offsets)?;

        for (name, bpf) in [
            (names::CPU_TIME_OBJECT, &mut cpu_time),
            (names::ACTIVE_PROCS_OBJECT, &mut active_procs),
        ] {
            if let Err(e) = spawn_logger(bpf) {
                warn!(
                    "Failed to initialize EbpfLogger for {}: {:#}. eBPF logs will not be visible.",
                    name, e
                );
            }
        }

        let btf = Btf::from_sys_fs().context("Failed to load kernel BTF")?;

        Ok(Self {
            cpu_time,
            active_procs,
            btf,
            variant: None,
        })
    }

    /// Load the task iterator for `variant`
    pub fn load_cpu_time(&mut self, variant: CpuTimeVariant) -> Result<()> {
        if let Some(loaded) = self.variant {
            return Err(anyhow!("CPU-time iterator already loaded ({:?})", loaded));
        }
        info!("Loading {} task iterator...", variant.program());

        let program: &mut Iter = self
            .cpu_time
            .program_mut(variant.program())
            .ok_or_else(|| anyhow!("{} program not found in eBPF object", variant.program()))?
            .try_into()?;
        program
            .load("task", &self.btf)
            .with_context(|| format!("Failed to load {}", variant.program()))?;

        self.variant = Some(variant);
        Ok(())
    }

    /// Walk every task once.
    ///
    /// Each pass attaches a fresh iterator link and reads it to EOF; the
    /// program writes nothing to the iterator, so the read is empty.
    pub fn run_iteration(&mut self) -> Result<()> {
        let variant = self
            .variant
            .ok_or_else(|| anyhow!("CPU-time iterator not loaded"))?;

        let program: &mut Iter = self
            .cpu_time
            .program_mut(variant.program())
            .ok_or_else(|| anyhow!("{} program not found in eBPF object", variant.program()))?
            .try_into()?;

        let link_id = program.attach().context("Failed to attach task iterator")?;
        let link = program.take_link(link_id)?;
        let mut iter = link.into_file().context("Failed to create task iterator")?;

        let mut out = Vec::new();
        iter.read_to_end(&mut out)
            .context("Failed to read task iterator")?;
        debug!("Task iteration pass done ({} bytes of output)", out.len());
        Ok(())
    }

    /// Attach the active-process tracker to `sched_switch`
    pub fn attach_sched_switch(&mut self) -> Result<()> {
        info!("Attaching {} to sched_switch...", names::HANDLE_SCHED_SWITCH);

        let program: &mut BtfTracePoint = self
            .active_procs
            .program_mut(names::HANDLE_SCHED_SWITCH)
            .ok_or_else(|| {
                anyhow!(
                    "{} program not found in eBPF object",
                    names::HANDLE_SCHED_SWITCH
                )
            })?
            .try_into()?;

        program.load("sched_switch", &self.btf)?;
        program
            .attach()
            .context("Failed to attach to sched_switch")?;

        info!("Active-process tracker attached");
        Ok(())
    }

    /// Drain the CPU-time map of the loaded variant
    pub fn drain_cpu_time(&mut self) -> Result<Vec<CpuSample>> {
        let variant = self
            .variant
            .ok_or_else(|| anyhow!("CPU-time iterator not loaded"))?;
        let map = map_mut(&mut self.cpu_time, variant.map())?;

        match variant {
            CpuTimeVariant::WithComm => {
                let mut map: HashMap<_, i32, ProcessInfo> = HashMap::try_from(map)
                    .with_context(|| format!("Failed to open {}", names::PROCESS_MAP))?;
                collector::drain_cpu_time(&mut map)
            }
            CpuTimeVariant::Minimal => {
                let mut map: HashMap<_, i32, u64> = HashMap::try_from(map)
                    .with_context(|| format!("Failed to open {}", names::CPU_TIME_MAP))?;
                collector::drain_cpu_time(&mut map)
            }
        }
    }

    /// Drain the active-process map
    pub fn drain_active_procs(&mut self) -> Result<Vec<ActiveProcess>> {
        let map = map_mut(&mut self.active_procs, names::ACTIVE_PROCS)?;
        let mut map: HashMap<_, u32, ActiveProc> = HashMap::try_from(map)
            .with_context(|| format!("Failed to open {}", names::ACTIVE_PROCS))?;
        collector::drain_active_procs(&mut map)
    }

    /// Detach and unload all probes
    pub fn unload(self) {
        info!("Unloading eBPF probes...");
        drop(self.cpu_time);
        drop(self.active_procs);
        info!("Probes unloaded");
    }
}

fn load_object(name: &str, bytes: &[u8], offsets: &TaskOffsets) -> Result<Ebpf> {
    EbpfLoader::new()
        .override_global(names::TASK_OFFSETS, offsets, true)
        .load(bytes)
        .with_context(|| format!("Failed to load eBPF object {}", name))
}

/// Forward eBPF log records to `log` from a task on the current runtime
fn spawn_logger(bpf: &mut Ebpf) -> Result<()> {
    let runtime = tokio::runtime::Handle::try_current().context("No tokio runtime")?;
    let logger = EbpfLogger::init(bpf)?;

    let _guard = runtime.enter();
    let mut logger = AsyncFd::with_interest(logger, Interest::READABLE)?;
    runtime.spawn(async move {
        loop {
            let mut guard = match logger.readable_mut().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("eBPF log reader stopped: {}", e);
                    break;
                }
            };
            guard.get_inner_mut().flush();
            guard.clear_ready();
        }
    });
    Ok(())
}

fn map_mut<'a>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut Map> {
    // Collect map names first to avoid borrow conflict in error path
    let available_maps: Vec<_> = bpf.maps().map(|(name, _)| name.to_string()).collect();
    bpf.map_mut(name).ok_or_else(|| {
        anyhow!(
            "{} map not found in eBPF object. Available maps: {:?}",
            name,
            available_maps
        )
    })
}

/// Lift the locked-memory limit for kernels that still charge maps to it
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: rlim is a valid rlimit for the duration of the call
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory, ret is: {}", ret);
    }
}

/// Run pre-flight checks to validate the system can run eBPF programs
fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf()?;
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to get kernel version")?;
    let version = parse_kernel_version(&release)?;

    if version < MIN_KERNEL {
        return Err(anyhow!(
            "Kernel {} is too old. Task iterators require kernel {}.{}+",
            release.trim(),
            MIN_KERNEL.0,
            MIN_KERNEL.1
        ));
    }

    info!("Kernel version: {} (supported)", release.trim());
    Ok(())
}

/// `(major, minor)` of a release string such as `6.8.0-45-generic`
pub fn parse_kernel_version(release: &str) -> Result<(u32, u32)> {
    let release = release.trim();
    let mut parts = release.split('.');

    let major = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("Could not parse kernel version: {}", release))?;
    let minor = parts
        .next()
        .map(|s| s.split(|c: char| !c.is_ascii_digit()).next().unwrap_or(s))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("Could not parse kernel version: {}", release))?;

    Ok((major, minor))
}

/// BTF is required: both the iterator and `tp_btf` programs are verified
/// against it, and task offsets come from it.
fn check_btf() -> Result<()> {
    if !Path::new(VMLINUX_BTF).exists() {
        return Err(anyhow!(
            "BTF not found at {}. Rebuild the kernel with CONFIG_DEBUG_INFO_BTF=y",
            VMLINUX_BTF
        ));
    }

    info!("BTF available");
    Ok(())
}

fn check_capabilities() {
    // SAFETY: geteuid has no preconditions
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_PERFMON are granted.",
            euid
        );
    } else {
        info!("Running with root privileges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic\n").unwrap(), (6, 8));
        let wsl = "5.15.153.1-microsoft-standard-WSL2";
        assert_eq!(parse_kernel_version(wsl).unwrap(), (5, 15));
        assert_eq!(parse_kernel_version("5.8-rc1").unwrap(), (5, 8));
        assert!(parse_kernel_version("linux").is_err());
        assert!(parse_kernel_version("6").is_err());
    }

    #[test]
    fn test_minimum_kernel_ordering() {
        assert!((5, 4) < MIN_KERNEL);
        assert!((5, 8) >= MIN_KERNEL);
        assert!((6, 1) > MIN_KERNEL);
    }

    #[test]
    fn test_cpu_time_object_has_task_iterators() {
        // empty when the build skipped the eBPF objects
        if CPU_TIME_OBJECT.is_empty() {
            return;
        }
        let object = aya_obj::Object::parse(CPU_TIME_OBJECT).unwrap();
        for variant in [CpuTimeVariant::WithComm, CpuTimeVariant::Minimal] {
            let program = &object.programs[variant.program()];
            assert!(
                matches!(program.section, aya_obj::ProgramSection::Iter { .. }),
                "{} is not a task iterator",
                variant.program()
            );
            assert!(object.maps.contains_key(variant.map()));
        }
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(CpuTimeVariant::WithComm.program(), "sum_cpu_time");
        assert_eq!(CpuTimeVariant::WithComm.map(), "PROCESS_MAP");
        assert_eq!(CpuTimeVariant::Minimal.program(), "sum_cpu_ticks");
        assert_eq!(CpuTimeVariant::Minimal.map(), "CPU_TIME_MAP");
    }
}
