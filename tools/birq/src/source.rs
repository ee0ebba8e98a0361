// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Where the control loop gets its view of the host and where it sends its
//! decisions. The host implementations read procfs and sysfs, tests plug in
//! their own.

use std::collections::BTreeMap;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use birq_utils::AffinityWriter;
use birq_utils::Cpumask;
use birq_utils::Interrupt;
use birq_utils::InterruptReader;
use birq_utils::ProximityTable;
use birq_utils::Topology;
use log::trace;

use crate::stats::CpuTimes;

pub trait SystemSource {
    fn scan_topology(&mut self) -> Result<Topology>;

    fn scan_cpu_times(&mut self) -> Result<BTreeMap<usize, CpuTimes>>;

    /// Current interrupts, tagged with their proximity node overrides.
    fn scan_irqs(&mut self, pxm: &ProximityTable) -> Result<Vec<Interrupt>>;
}

pub trait AffinityCommitter {
    fn apply(&mut self, irq: usize, mask: &Cpumask) -> Result<()>;
}

pub struct HostSource {
    proc_reader: procfs::ProcReader,
    irq_reader: InterruptReader,
}

impl Default for HostSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSource {
    pub fn new() -> Self {
        Self {
            proc_reader: procfs::ProcReader::new(),
            irq_reader: InterruptReader::new(),
        }
    }
}

impl SystemSource for HostSource {
    fn scan_topology(&mut self) -> Result<Topology> {
        Topology::new()
    }

    fn scan_cpu_times(&mut self) -> Result<BTreeMap<usize, CpuTimes>> {
        let cpus_map = self
            .proc_reader
            .read_stat()
            .context("Failed to read procfs")?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?;

        let mut times = BTreeMap::new();
        for (cpu, stat) in cpus_map.iter() {
            match CpuTimes::from_procfs(stat) {
                Some(t) => {
                    times.insert(*cpu as usize, t);
                }
                None => trace!("CPU {} has incomplete stat fields", cpu),
            }
        }
        Ok(times)
    }

    fn scan_irqs(&mut self, pxm: &ProximityTable) -> Result<Vec<Interrupt>> {
        self.irq_reader.read(pxm)
    }
}

#[derive(Default)]
pub struct ProcAffinity {
    writer: AffinityWriter,
}

impl ProcAffinity {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AffinityCommitter for ProcAffinity {
    fn apply(&mut self, irq: usize, mask: &Cpumask) -> Result<()> {
        self.writer.write(irq, mask)
    }
}
