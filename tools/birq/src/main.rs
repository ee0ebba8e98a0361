// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use birq::balance::Strategy;
use birq::config::ConfigLoader;
use birq::config::ConfigOverrides;
use birq::config::DEFAULT_CONFIG_PATH;
use birq::control::Daemon;
use birq::pidfile::PidFile;
use birq::signals::Signals;
use birq::source::HostSource;
use birq::source::ProcAffinity;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

/// birq: Balance IRQ affinity across CPUs
///
/// birq periodically looks at how busy each CPU is and how often each
/// interrupt fires. When a CPU is above the threshold, one of its interrupts
/// is moved to the least loaded CPU of the interrupt's NUMA node, provided
/// that CPU stays under the load limit. Newly appearing interrupts which
/// may be delivered to many CPUs are pinned to a single one.
///
/// SIGHUP reloads the configuration and proximity files. SIGTERM, SIGINT and
/// SIGQUIT stop the daemon.
#[derive(Debug, Parser)]
struct Opts {
    /// Configuration file.
    #[clap(short = 'c', long)]
    conf: Option<PathBuf>,

    /// Proximity file mapping IRQs and PCI devices to NUMA nodes.
    #[clap(short = 'x', long)]
    pxm: Option<PathBuf>,

    /// Write the daemon's PID to this file. Fails if it already exists.
    #[clap(short = 'p', long)]
    pid: Option<PathBuf>,

    /// CPU load percentage above which IRQs are moved off a CPU. Overrides
    /// the configuration file.
    #[clap(short = 't', long)]
    threshold: Option<f64>,

    /// CPU load percentage a destination must stay under. Overrides the
    /// configuration file.
    #[clap(short = 'l', long)]
    load_limit: Option<f64>,

    /// Seconds between cycles after IRQs were moved.
    #[clap(short = 'i', long)]
    short_interval: Option<u64>,

    /// Seconds between cycles when nothing was moved.
    #[clap(short = 'I', long)]
    long_interval: Option<u64>,

    /// Which IRQ to move off an overloaded CPU.
    #[clap(short = 's', long, value_enum)]
    strategy: Option<Strategy>,

    /// Seed for the rnd strategy. Random by default.
    #[clap(long)]
    seed: Option<u64>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let signals = Signals::install().context("Error setting signal handlers")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let overrides = ConfigOverrides {
        threshold: opts.threshold,
        load_limit: opts.load_limit,
        short_interval: opts.short_interval,
        long_interval: opts.long_interval,
        strategy: opts.strategy,
    };
    let loader = match &opts.conf {
        Some(path) => ConfigLoader::new(path, true, overrides),
        None => ConfigLoader::new(Path::new(DEFAULT_CONFIG_PATH), false, overrides),
    };

    let mut daemon = Daemon::new(
        loader,
        opts.pxm.clone(),
        opts.seed,
        HostSource::new(),
        ProcAffinity::new(),
    )?;

    let _pidfile = match &opts.pid {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    daemon.run(&signals);
    Ok(())
}
