use crate::cli::{Commands, SamplingArgs};
use crate::error::ProcscopeError;
use crate::report::{self, ScanSummary};
use crate::Result;
use procscope_agent::{btf, ProcFs};
use procscope_common::TaskOffsets;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Top {
            sampling,
            count,
            minimal,
        } => handle_top(sampling, count, minimal).await,
        Commands::Active {
            sampling,
            only_isolated,
            isolated,
        } => handle_active(sampling, only_isolated, isolated).await,
        Commands::Allproc { sampling } => handle_allproc(sampling).await,
        Commands::Offsets { btf, json } => handle_offsets(btf, json),
    }
}

fn ticker(sampling: &SamplingArgs) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_millis(sampling.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Discover `task_struct` offsets from `path` or the running kernel.
pub fn discover_offsets(path: Option<&PathBuf>) -> Result<TaskOffsets> {
    let offsets = match path {
        Some(path) => btf::task_offsets_from_path(path),
        None => btf::task_offsets(),
    }
    .map_err(ProcscopeError::btf)?;
    info!("task_struct offsets: {:?}", offsets);
    Ok(offsets)
}

pub fn render_offsets(offsets: &TaskOffsets, json: bool) -> String {
    if json {
        serde_json::json!({
            "pid": offsets.pid,
            "tgid": offsets.tgid,
            "utime": offsets.utime,
            "stime": offsets.stime,
            "comm": offsets.comm,
        })
        .to_string()
    } else {
        format!(
            "task_struct offsets:\n  pid:   {}\n  tgid:  {}\n  utime: {}\n  stime: {}\n  comm:  {}",
            offsets.pid, offsets.tgid, offsets.utime, offsets.stime, offsets.comm
        )
    }
}

fn handle_offsets(path: Option<PathBuf>, json: bool) -> Result<()> {
    let offsets = discover_offsets(path.as_ref())?;
    println!("{}", render_offsets(&offsets, json));
    Ok(())
}

/// Read the stat of every process once and measure the cost.
pub fn scan_window(procfs: &ProcFs, window: u64) -> Result<ScanSummary> {
    let started = Instant::now();
    let scan = procfs.scan().map_err(ProcscopeError::procfs)?;
    for pid in &scan.failed {
        warn!("Cannot read stat for pid {}", pid);
    }
    Ok(ScanSummary {
        window,
        processes: scan.stats.len() + scan.failed.len(),
        failed: scan.failed.len(),
        cost_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    })
}

async fn handle_allproc(sampling: SamplingArgs) -> Result<()> {
    let procfs = ProcFs::new();
    let mut ticker = ticker(&sampling);
    info!("Starting loop, interval {}ms", sampling.interval_ms);

    let mut window: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                window += 1;
                match scan_window(&procfs, window) {
                    Ok(summary) => {
                        info!(
                            "AllProcs: {} read in {}us",
                            summary.processes, summary.cost_us
                        );
                        println!("{}", report::render_scan(&summary, sampling.json)?);
                    }
                    Err(e) => error!("Cannot scan processes: {}", e),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
use linux::{handle_active, handle_top};

#[cfg(target_os = "linux")]
mod linux {
    use super::{discover_offsets, ticker};
    use crate::cli::SamplingArgs;
    use crate::error::ProcscopeError;
    use crate::report::{self, ActiveRow};
    use crate::Result;
    use procscope_agent::procstat::{self, ProcFs};
    use procscope_agent::{CpuTimeCollector, CpuTimeVariant, IsolatedTracker, ProbeManager};
    use std::time::Instant;
    use tokio::signal;
    use tracing::{debug, error, info, warn};

    pub async fn handle_top(sampling: SamplingArgs, count: usize, minimal: bool) -> Result<()> {
        let offsets = discover_offsets(None)?;
        let mut probes = ProbeManager::new(offsets).map_err(ProcscopeError::ebpf)?;

        let variant = if minimal {
            CpuTimeVariant::Minimal
        } else {
            CpuTimeVariant::WithComm
        };
        probes.load_cpu_time(variant).map_err(ProcscopeError::load)?;

        let mut collector = CpuTimeCollector::default();
        let mut ticker = ticker(&sampling);
        info!(
            "Monitoring CPU usage at {}ms intervals... Press Ctrl+C to exit",
            sampling.interval_ms
        );

        // The first tick fires immediately and only establishes a baseline.
        let mut window: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match collector.collect(&mut probes) {
                        Ok(usage) => {
                            window += 1;
                            if sampling.json {
                                println!("{}", report::render_cpu_json(window, &usage, count)?);
                            } else {
                                let elapsed = started.elapsed();
                                print!(
                                    "{}",
                                    report::render_cpu_table(window, &usage, count, elapsed)
                                );
                            }
                        }
                        Err(e) => error!("Error collecting CPU data: {:#}", e),
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down...");
                    break;
                }
            }
        }

        probes.unload();
        Ok(())
    }

    pub async fn handle_active(
        sampling: SamplingArgs,
        only_isolated: bool,
        isolated: Option<String>,
    ) -> Result<()> {
        let procfs = ProcFs::new();
        let isolated_cpus = match isolated {
            Some(list) => procstat::parse_isolated_cpus(list.trim())
                .map_err(|e| ProcscopeError::ConfigError(format!("--isolated: {:#}", e)))?,
            None => procfs.read_isolated_cpus().map_err(ProcscopeError::procfs)?,
        };
        info!(
            "Isolated CPUs: {} {:?}",
            isolated_cpus.len(),
            isolated_cpus
        );
        if only_isolated && isolated_cpus.is_empty() {
            return Err(ProcscopeError::ConfigError(
                "--only-isolated requires at least one isolated CPU".to_string(),
            ));
        }
        let clk_tck = procstat::clock_ticks();

        let offsets = discover_offsets(None)?;
        let mut probes = ProbeManager::new(offsets).map_err(ProcscopeError::ebpf)?;
        probes
            .attach_sched_switch()
            .map_err(ProcscopeError::attach)?;

        let mut tracker = IsolatedTracker::new(&isolated_cpus);
        let mut ticker = ticker(&sampling);
        info!("Starting loop, interval {}ms", sampling.interval_ms);

        let mut window: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let active = match probes.drain_active_procs() {
                        Ok(active) => active,
                        Err(e) => {
                            error!("Error reading active procs: {:#}", e);
                            continue;
                        }
                    };
                    window += 1;

                    let mut rows = Vec::new();
                    if only_isolated {
                        for process in active {
                            tracker.track(process);
                        }
                        // An isolated CPU without a switch keeps running the same processes.
                        let cpus: Vec<u32> = tracker.cpus().collect();
                        for cpu in cpus {
                            let (activity, procs) = tracker.active_procs(cpu);
                            for process in procs {
                                let pid = process.pid;
                                match procfs.read_pid_stat(pid) {
                                    Ok(stat) => rows.push(ActiveRow::new(
                                        process,
                                        Some(&stat),
                                        clk_tck,
                                        Some(activity),
                                    )),
                                    Err(e) => {
                                        warn!("Cannot read /proc/<pid>/stat for {}: {:#}", pid, e);
                                        tracker.remove(pid);
                                    }
                                }
                            }
                        }
                        debug!("{} processes held on isolated CPUs", tracker.tracked());
                    } else {
                        for process in active {
                            let stat = procfs.read_pid_stat(process.pid);
                            if let Err(e) = &stat {
                                warn!("Cannot read /proc/<pid>/stat for {}: {:#}", process.pid, e);
                            }
                            rows.push(ActiveRow::new(process, stat.as_ref().ok(), clk_tck, None));
                        }
                    }

                    let elapsed = started.elapsed();
                    if sampling.json {
                        println!("{}", report::render_active_json(window, &rows)?);
                    } else {
                        print!("{}", report::render_active_table(window, &rows, elapsed));
                    }
                    info!("ActiveProcs: {} read in {:?}", rows.len(), started.elapsed());
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down...");
                    break;
                }
            }
        }

        probes.unload();
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
async fn handle_top(
    _sampling: SamplingArgs,
    _count: usize,
    _minimal: bool,
) -> Result<()> {
    Err(ProcscopeError::UnsupportedFeature(
        "eBPF probes require Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
async fn handle_active(
    _sampling: SamplingArgs,
    _only_isolated: bool,
    _isolated: Option<String>,
) -> Result<()> {
    Err(ProcscopeError::UnsupportedFeature(
        "eBPF probes require Linux".to_string(),
    ))
}
