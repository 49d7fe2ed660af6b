//! Window reports: fixed-width tables and JSON

use procscope_agent::{ActiveProcess, Activity, PidStat, ProcessUsage};
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;

use crate::Result;

const RULE: &str = concat!(
    "-----------------------------------------------",
    "------------------------------------------------"
);

/// Shorten `s` to at most `max` characters, marking the cut with `...`
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// The first `count` entries, or all of them when `count` is 0
pub fn top(usage: &[ProcessUsage], count: usize) -> &[ProcessUsage] {
    if count == 0 {
        usage
    } else {
        &usage[..count.min(usage.len())]
    }
}

pub fn render_cpu_table(
    window: u64,
    usage: &[ProcessUsage],
    count: usize,
    elapsed: Duration,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nCPU Usage (window {}):", window);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "{:<7} {:<15} {:<15} {:<20} {:<30}",
        "PID", "CPU (last int)", "Total CPU Time", "Command", "Executable"
    );
    for process in top(usage, count) {
        let _ = writeln!(
            out,
            "{:<7} {:<15} {:<15} {:<20} {:<30}",
            process.pid,
            format!("{:.2}s", process.cpu_delta_secs),
            format!("{:.2}s", process.total_secs),
            truncate(&process.comm, 20),
            truncate(&process.executable, 30)
        );
    }
    let _ = writeln!(out, "---- {} processes in {:?} ----", usage.len(), elapsed);
    out
}

#[derive(Serialize)]
struct CpuWindow<'a> {
    window: u64,
    total_processes: usize,
    processes: &'a [ProcessUsage],
}

pub fn render_cpu_json(window: u64, usage: &[ProcessUsage], count: usize) -> Result<String> {
    Ok(serde_json::to_string(&CpuWindow {
        window,
        total_processes: usage.len(),
        processes: top(usage, count),
    })?)
}

/// One line of the active-process report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRow {
    pub pid: u32,
    pub cpu: u32,
    pub comm: String,
    /// `None` when `/proc/<pid>/stat` could not be read
    pub utime_secs: Option<f64>,
    pub stime_secs: Option<f64>,
    /// For isolated CPUs: whether the process switched in this window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seen: Option<&'static str>,
}

impl ActiveRow {
    pub fn new(
        process: ActiveProcess,
        stat: Option<&PidStat>,
        clk_tck: u64,
        activity: Option<Activity>,
    ) -> Self {
        let secs = |ticks: u64| ticks as f64 / clk_tck.max(1) as f64;
        Self {
            pid: process.pid,
            cpu: process.cpu,
            comm: process.comm,
            utime_secs: stat.map(|s| secs(s.utime)),
            stime_secs: stat.map(|s| secs(s.stime)),
            seen: activity.map(|a| match a {
                Activity::Current => "current",
                Activity::Previous => "previous",
            }),
        }
    }
}

pub fn render_active_table(window: u64, rows: &[ActiveRow], elapsed: Duration) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nActive processes (window {}):", window);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "{:<7} {:<4} {:<20} {:<12} {:<12} {:<8}",
        "PID", "CPU", "Command", "User", "System", "Seen"
    );
    let secs = |v: Option<f64>| v.map(|v| format!("{:.2}s", v)).unwrap_or_else(|| "-".to_string());
    for row in rows {
        let _ = writeln!(
            out,
            "{:<7} {:<4} {:<20} {:<12} {:<12} {:<8}",
            row.pid,
            row.cpu,
            truncate(&row.comm, 20),
            secs(row.utime_secs),
            secs(row.stime_secs),
            row.seen.unwrap_or("")
        );
    }
    let _ = writeln!(out, "---- {} processes in {:?} ----", rows.len(), elapsed);
    out
}

#[derive(Serialize)]
struct ActiveWindow<'a> {
    window: u64,
    processes: &'a [ActiveRow],
}

pub fn render_active_json(window: u64, rows: &[ActiveRow]) -> Result<String> {
    Ok(serde_json::to_string(&ActiveWindow {
        window,
        processes: rows,
    })?)
}

/// Cost of one full `/proc` scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub window: u64,
    pub processes: usize,
    /// Listed pids whose stat could not be read
    pub failed: usize,
    pub cost_us: u64,
}

pub fn render_scan(summary: &ScanSummary, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(summary)?);
    }
    Ok(format!(
        "AllProcs (window {}): {} processes, {} unreadable, cost {:?}",
        summary.window,
        summary.processes,
        summary.failed,
        Duration::from_micros(summary.cost_us)
    ))
}
