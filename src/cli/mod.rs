pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "procscope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-process CPU time and active-process tracking with eBPF", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        env = "PROCSCOPE_VERBOSE",
        help = "Enable verbose logging"
    )]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options shared by the sampling commands
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SamplingArgs {
    #[arg(
        short,
        long = "interval-ms",
        default_value_t = 1000,
        env = "PROCSCOPE_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(100..),
        help = "Sampling window length in milliseconds"
    )]
    pub interval_ms: u64,

    #[arg(long, env = "PROCSCOPE_JSON", help = "Print one JSON object per window")]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show per-process CPU usage for each window")]
    Top {
        #[command(flatten)]
        sampling: SamplingArgs,

        #[arg(
            short = 'n',
            long,
            default_value_t = 0,
            env = "PROCSCOPE_COUNT",
            help = "Number of top processes to show (0 for all)"
        )]
        count: usize,

        #[arg(
            long,
            env = "PROCSCOPE_MINIMAL",
            help = "Collect CPU time only; command names come from /proc"
        )]
        minimal: bool,
    },
    #[command(about = "Show processes that ran during each window")]
    Active {
        #[command(flatten)]
        sampling: SamplingArgs,

        #[arg(
            long,
            env = "PROCSCOPE_ONLY_ISOLATED",
            help = "Only report processes on isolated CPUs"
        )]
        only_isolated: bool,

        #[arg(
            long,
            value_name = "LIST",
            env = "PROCSCOPE_ISOLATED",
            help = "Isolated CPU list (e.g. 2-3,6); defaults to /sys/devices/system/cpu/isolated"
        )]
        isolated: Option<String>,
    },
    #[command(about = "Read every /proc/<pid>/stat each window and report the cost")]
    Allproc {
        #[command(flatten)]
        sampling: SamplingArgs,
    },
    #[command(about = "Print the task_struct offsets discovered from BTF")]
    Offsets {
        #[arg(
            long,
            value_name = "PATH",
            env = "PROCSCOPE_BTF",
            help = "Raw BTF file (defaults to /sys/kernel/btf/vmlinux)"
        )]
        btf: Option<PathBuf>,

        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
}
