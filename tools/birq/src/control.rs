// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Control loop
//!
//! Every cycle the daemon
//!
//! 1. services a pending reload request,
//! 2. scans topology, CPU times and interrupts,
//! 3. links each IRQ to its owning CPU and home node,
//! 4. turns the previous and current snapshots into loads and rates,
//! 5. lets the balancer decide relocations and commits them,
//! 6. sleeps the short interval if anything was relocated, the long one
//!    otherwise.
//!
//! A termination request moves the loop from Running to Draining, where no
//! new cycle starts and tracked state is released, and then to Stopped.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use birq_utils::is_refused;
use birq_utils::Cpumask;
use birq_utils::Interrupt;
use birq_utils::ProximityTable;
use birq_utils::Topology;
use log::debug;
use log::error;
use log::info;
use log::log_enabled;
use log::trace;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;

use crate::balance::Chooser;
use crate::balance::CpuState;
use crate::balance::IrqState;
use crate::balance::LoadBalancer;
use crate::balance::Reason;
use crate::balance::Relocation;
use crate::config::Config;
use crate::config::ConfigLoader;
use crate::signals::Signals;
use crate::source::AffinityCommitter;
use crate::source::SystemSource;
use crate::stats::Snapshot;
use crate::stats::Statistics;

fn signed(x: f64) -> String {
    if x >= 0.0f64 {
        format!("{:+7.2}", x)
    } else {
        format!("{:7.2}", x)
    }
}

struct Metrics {
    cycles: Counter,
    overload_relocations: Counter,
    placement_relocations: Counter,
    commit_failures: Counter,
    reloads_ok: Counter,
    reloads_unchanged: Counter,
    reloads_rejected: Counter,
    overloaded_cpus: Gauge,
    cpu_load_pct: Histogram,
    cycle_duration: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            cycles: counter!("birq_cycles_total"),
            overload_relocations: counter!("birq_relocations_total", "reason" => "overload"),
            placement_relocations: counter!("birq_relocations_total", "reason" => "placement"),
            commit_failures: counter!("birq_commit_failures_total"),
            reloads_ok: counter!("birq_reloads_total", "result" => "ok"),
            reloads_unchanged: counter!("birq_reloads_total", "result" => "unchanged"),
            reloads_rejected: counter!("birq_reloads_total", "result" => "rejected"),

            overloaded_cpus: gauge!("birq_overloaded_cpus"),

            cpu_load_pct: histogram!("birq_cpu_load_pct"),
            cycle_duration: histogram!("birq_cycle_duration_us"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// New configuration swapped in.
    Reloaded,
    /// Nothing to read, current configuration kept.
    Unchanged,
    /// Candidate failed to load or validate, current configuration kept.
    Rejected,
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReloadOutcome::Reloaded => "reloaded",
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// What one cycle saw and did.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// Scanning failed, nothing was decided.
    pub skipped: bool,
    pub cpus: BTreeMap<usize, CpuState>,
    /// Managed IRQs as the balancer saw them.
    pub irqs: BTreeMap<usize, IrqState>,
    pub overloaded: Vec<usize>,
    /// Everything the balancer decided.
    pub relocations: Vec<Relocation>,
    /// The subset the kernel accepted.
    pub committed: Vec<Relocation>,
    pub failures: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn next_interval(&self, config: &Config) -> Duration {
        if self.relocations.is_empty() {
            config.long_interval()
        } else {
            config.short_interval()
        }
    }

    pub fn format<W: Write>(&self, w: &mut W, threshold: f64) -> Result<()> {
        writeln!(
            w,
            "irqs={} overloaded={} relocated={}/{} failed={} took={:.2}ms",
            self.irqs.len(),
            self.overloaded.len(),
            self.committed.len(),
            self.relocations.len(),
            self.failures,
            self.duration.as_secs_f64() * 1000.0,
        )?;

        for cpu in self.cpus.values().filter(|c| c.online) {
            if !cpu.load_valid {
                writeln!(w, "  CPU[{:03}] node={} load=    n/a", cpu.id, cpu.node)?;
                continue;
            }
            writeln!(
                w,
                "  CPU[{:03}] node={} load={:6.2} irq={:6.2} over={}{}",
                cpu.id,
                cpu.node,
                cpu.load,
                cpu.irq_load,
                signed(cpu.load - threshold),
                if cpu.excluded { " excluded" } else { "" },
            )?;
        }

        for reloc in self.committed.iter() {
            writeln!(w, "  {}", reloc)?;
        }
        Ok(())
    }
}

/// IRQ bookkeeping which outlives a single cycle.
#[derive(Debug, Default)]
struct IrqTracker {
    known: BTreeSet<usize>,
    /// IRQs whose affinity the kernel refused to change.
    refused: BTreeSet<usize>,
}

impl IrqTracker {
    /// Record the IRQs present this cycle and return the ones seen for the
    /// first time. IRQs which disappeared are forgotten entirely.
    fn update(&mut self, irqs: &[Interrupt]) -> BTreeSet<usize> {
        let present: BTreeSet<usize> = irqs.iter().map(|i| i.irq).collect();
        let fresh = present.difference(&self.known).copied().collect();

        for gone in self.known.difference(&present) {
            trace!("IRQ {} disappeared", gone);
        }
        self.refused.retain(|irq| present.contains(irq));
        self.known = present;

        fresh
    }

    fn refuse(&mut self, irq: usize) {
        self.refused.insert(irq);
    }

    fn is_refused(&self, irq: usize) -> bool {
        self.refused.contains(&irq)
    }

    fn clear(&mut self) {
        self.known.clear();
        self.refused.clear();
    }
}

pub struct Daemon<S: SystemSource, C: AffinityCommitter> {
    loader: ConfigLoader,
    config: Config,
    pxm_path: Option<PathBuf>,
    pxm: ProximityTable,
    seed: Option<u64>,
    chooser: Box<dyn Chooser>,

    source: S,
    committer: C,

    topology: Topology,
    tracker: IrqTracker,
    prev: Option<(Snapshot, Instant)>,
    state: LoopState,

    metrics: Metrics,
}

impl<S: SystemSource, C: AffinityCommitter> Daemon<S, C> {
    /// Load the configuration and proximity table and take the initial
    /// topology. Any failure here is fatal.
    pub fn new(
        loader: ConfigLoader,
        pxm_path: Option<PathBuf>,
        seed: Option<u64>,
        mut source: S,
        committer: C,
    ) -> Result<Self> {
        let config = loader.initial()?;
        let topology = source.scan_topology()?;

        let mut pxm = match &pxm_path {
            Some(path) => ProximityTable::load(path)?,
            None => ProximityTable::new(),
        };
        pxm.retain_nodes(|node| topology.node(node).is_some());

        info!(
            "birq: {} CPUs, {} NUMA nodes, {} proximity entries, strategy {}",
            topology.span().weight(),
            topology.nodes().len(),
            pxm.len(),
            config.strategy
        );

        let chooser = config.strategy.chooser(seed);
        Ok(Self {
            loader,
            config,
            pxm_path,
            pxm,
            seed,
            chooser,
            source,
            committer,
            topology,
            tracker: IrqTracker::default(),
            prev: None,
            state: LoopState::Running,
            metrics: Metrics::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Re-read the configuration and proximity files. The running
    /// configuration is only replaced by a candidate that fully validates.
    pub fn reload(&mut self) -> ReloadOutcome {
        let outcome = match self.loader.load() {
            Ok(Some(config)) => {
                if config.strategy != self.config.strategy {
                    self.chooser = config.strategy.chooser(self.seed);
                }
                self.config = config;
                info!("Reloaded configuration from {:?}", self.loader.path());
                ReloadOutcome::Reloaded
            }
            Ok(None) => {
                debug!("No configuration at {:?}, keeping the current one", self.loader.path());
                ReloadOutcome::Unchanged
            }
            Err(e) => {
                error!("Failed to reload configuration, keeping the current one: {:#}", e);
                ReloadOutcome::Rejected
            }
        };

        if let Some(path) = &self.pxm_path {
            match ProximityTable::load(path) {
                Ok(mut pxm) => {
                    let topology = &self.topology;
                    pxm.retain_nodes(|node| topology.node(node).is_some());
                    self.pxm = pxm;
                }
                Err(e) => warn!("Failed to reload proximity table, keeping the current one: {:#}", e),
            }
        }

        match outcome {
            ReloadOutcome::Reloaded => self.metrics.reloads_ok.increment(1),
            ReloadOutcome::Unchanged => self.metrics.reloads_unchanged.increment(1),
            ReloadOutcome::Rejected => self.metrics.reloads_rejected.increment(1),
        }
        outcome
    }

    pub fn step(&mut self) -> CycleReport {
        self.step_at(Instant::now())
    }

    /// Run a single cycle as if it started at @now.
    pub fn step_at(&mut self, now: Instant) -> CycleReport {
        let started_at = Instant::now();
        self.metrics.cycles.increment(1);

        match self.source.scan_topology() {
            Ok(topology) => self.topology = topology,
            Err(e) => warn!("Failed to scan topology, reusing the previous one: {:#}", e),
        }

        let cpu_times = match self.source.scan_cpu_times() {
            Ok(times) => times,
            Err(e) => {
                warn!("Failed to scan CPU times, skipping cycle: {:#}", e);
                return CycleReport::skipped();
            }
        };
        let irqs = match self.source.scan_irqs(&self.pxm) {
            Ok(irqs) => irqs,
            Err(e) => {
                warn!("Failed to scan interrupts, skipping cycle: {:#}", e);
                return CycleReport::skipped();
            }
        };

        let snapshot = Snapshot {
            cpu_times,
            irq_counts: irqs.iter().map(|i| (i.irq, i.count)).collect(),
        };
        let (prev, interval) = match &self.prev {
            Some((prev, at)) => (Some(prev), now.saturating_duration_since(*at)),
            None => (None, Duration::ZERO),
        };
        let stats = Statistics::compute(prev, &snapshot, interval);
        let fresh = self.tracker.update(&irqs);

        let cpus = self.link_cpus(&stats);
        let irq_states = self.link_irqs(&irqs, &stats, &fresh);

        let params = self.config.balance_params();
        let mut lb = LoadBalancer::new(&params, &cpus, &irq_states);
        let overloaded = lb.overloaded();
        let relocations = lb.load_balance(self.chooser.as_mut());

        let mut report = CycleReport {
            skipped: false,
            overloaded,
            ..Default::default()
        };
        for reloc in relocations.iter() {
            if self.commit(reloc) {
                report.committed.push(reloc.clone());
            } else {
                report.failures += 1;
            }
        }
        report.relocations = relocations;
        report.cpus = cpus;
        report.irqs = irq_states;

        self.prev = Some((snapshot, now));

        report.duration = started_at.elapsed();
        self.metrics
            .overloaded_cpus
            .set(report.overloaded.len() as f64);
        for cpu in report.cpus.values().filter(|c| c.load_valid) {
            self.metrics.cpu_load_pct.record(cpu.load);
        }
        self.metrics
            .cycle_duration
            .record(report.duration.as_micros() as f64);

        report
    }

    fn link_cpus(&self, stats: &Statistics) -> BTreeMap<usize, CpuState> {
        let excluded = self.config.exclusion_mask(self.topology.nr_cpu_ids());

        self.topology
            .cpus()
            .values()
            .map(|cpu| {
                let load = stats.cpu(cpu.id());
                let state = CpuState {
                    id: cpu.id(),
                    node: cpu.node(),
                    core: cpu.core(),
                    online: cpu.online(),
                    excluded: excluded.test_cpu(cpu.id()),
                    load: load.load,
                    irq_load: load.irq_load,
                    load_valid: load.valid && cpu.online(),
                };
                (cpu.id(), state)
            })
            .collect()
    }

    fn link_irqs(
        &self,
        irqs: &[Interrupt],
        stats: &Statistics,
        fresh: &BTreeSet<usize>,
    ) -> BTreeMap<usize, IrqState> {
        let online = self.topology.span();
        let mut states = BTreeMap::new();

        for irq in irqs.iter() {
            let affinity = match &irq.affinity {
                Some(affinity) => affinity.and(online),
                None => {
                    trace!("IRQ {} has no affinity, not managed", irq.irq);
                    continue;
                }
            };
            if affinity.is_empty() {
                trace!("IRQ {} has no online CPU in its affinity, not managed", irq.irq);
                continue;
            }

            // An affinity spanning several nodes says nothing about locality.
            let home_node = irq.pxm_node.or(irq.device_node).or_else(|| {
                self.topology
                    .nodes()
                    .values()
                    .find(|node| affinity.and_not(node.span()).is_empty())
                    .map(|node| node.id())
            });
            let movable = !self.config.is_pinned(irq.irq)
                && irq.affinity_writable
                && !self.tracker.is_refused(irq.irq);

            states.insert(
                irq.irq,
                IrqState {
                    irq: irq.irq,
                    affinity,
                    home_node,
                    rate: stats.irq_rate(irq.irq),
                    movable,
                    fresh: fresh.contains(&irq.irq),
                },
            );
        }

        states
    }

    /// Returns whether the kernel accepted the new affinity.
    fn commit(&mut self, reloc: &Relocation) -> bool {
        let mut mask = Cpumask::new();
        if mask.set_cpu(reloc.to).is_err() {
            warn!("Invalid destination CPU {} for IRQ {}", reloc.to, reloc.irq);
            return false;
        }

        match self.committer.apply(reloc.irq, &mask) {
            Ok(()) => {
                match reloc.reason {
                    Reason::Overload => self.metrics.overload_relocations.increment(1),
                    Reason::Placement => self.metrics.placement_relocations.increment(1),
                }
                true
            }
            Err(e) => {
                self.metrics.commit_failures.increment(1);
                if is_refused(&e) {
                    warn!("Kernel refused to move IRQ {}, leaving it alone: {:#}", reloc.irq, e);
                    self.tracker.refuse(reloc.irq);
                } else {
                    warn!("Failed to move IRQ {}: {:#}", reloc.irq, e);
                }
                false
            }
        }
    }

    fn report(&self, report: &CycleReport) {
        for reloc in report.committed.iter() {
            info!("{}", reloc);
        }

        if !log_enabled!(log::Level::Debug) {
            return;
        }
        let mut buf = vec![];
        if report.format(&mut buf, self.config.threshold).is_ok() {
            for line in String::from_utf8_lossy(&buf).lines() {
                debug!("{}", line);
            }
        }
    }

    fn release(&mut self) {
        self.tracker.clear();
        self.prev = None;
    }

    /// Cycle until termination is requested.
    pub fn run(&mut self, signals: &Signals) {
        self.state = LoopState::Running;

        loop {
            match self.state {
                LoopState::Running => {
                    if signals.terminate_requested() {
                        self.state = LoopState::Draining;
                        continue;
                    }
                    if signals.take_reload() {
                        let outcome = self.reload();
                        debug!("Reload request: {}", outcome);
                    }

                    let report = self.step();
                    self.report(&report);

                    if !signals.sleep(report.next_interval(&self.config)) {
                        self.state = LoopState::Draining;
                    }
                }
                LoopState::Draining => {
                    info!("Exiting");
                    self.release();
                    self.state = LoopState::Stopped;
                }
                LoopState::Stopped => break,
            }
        }
    }
}
