use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use revalidator::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Hammers a resource cache with concurrent subscribe and invalidate workloads.
///
/// Every workload gets a simulated backend of its own. The report compares the number
/// of operations with the number of resolver calls, which shows how many fetches the
/// cache deduplicated.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Write all tracing output into the void, to measure its overhead without console noise.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local sink instead of the configured statsd server.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        revalidator::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::from_path(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    let options = logging::Options {
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: no other threads have been spawned yet
    let mut guard = unsafe { logging::init(&config, options)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    if let Some(udp_sink) = guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config.cache, workloads, cli.duration))
}
