// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Interrupts
//!
//! Snapshot of the host's numbered interrupts: the raw counters from
//! `/proc/interrupts`, the current affinity from `/proc/irq/N/smp_affinity`
//! and, for PCI devices, the address and NUMA node of the device raising the
//! interrupt from `/sys/bus/pci/devices/*`.
//!
//!```no_run
//!     use birq_utils::{InterruptReader, ProximityTable};
//!     let irqs = InterruptReader::new().read(&ProximityTable::new()).unwrap();
//!     for irq in irqs.iter() {
//!         println!("{} {} {:?}", irq.irq, irq.count, irq.affinity);
//!     }
//!```
//!
//! Architecture specific rows (NMI, LOC, ...) carry no number and can't be
//! steered, they are skipped.

use crate::misc::read_from_file;
use crate::Cpumask;
use crate::ProximityTable;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::warn;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

pub const PROCFS_ROOT: &str = "/proc";

/// One numbered row of `/proc/interrupts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptCount {
    pub irq: usize,
    /// Sum over all CPU columns.
    pub count: u64,
    /// Chip, hardware irq and action names.
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interrupt {
    pub irq: usize,
    pub count: u64,
    pub desc: String,
    /// None when the kernel doesn't expose `smp_affinity` for this IRQ.
    pub affinity: Option<Cpumask>,
    pub affinity_writable: bool,
    /// PCI address of the device raising the interrupt.
    pub device: Option<String>,
    /// Node the kernel reports for that device.
    pub device_node: Option<usize>,
    /// Node from the proximity table.
    pub pxm_node: Option<usize>,
}

impl Interrupt {
    pub fn new(irq: usize, count: u64) -> Interrupt {
        Interrupt {
            irq,
            count,
            desc: String::new(),
            affinity: None,
            affinity_writable: false,
            device: None,
            device_node: None,
            pxm_node: None,
        }
    }
}

/// Parse the content of `/proc/interrupts`.
pub fn parse_interrupts(content: &str) -> Result<Vec<InterruptCount>> {
    let mut lines = content.lines().skip_while(|l| l.trim().is_empty());
    let header = match lines.next() {
        Some(header) => header,
        None => bail!("Empty interrupts table"),
    };
    let nr_cols = header
        .split_whitespace()
        .filter(|col| col.starts_with("CPU"))
        .count();
    if nr_cols == 0 {
        bail!("No CPU columns in interrupts header {:?}", header);
    }

    let mut irqs = vec![];
    for line in lines {
        let (irq, rest) = match line.split_once(':') {
            Some((irq, rest)) => (irq.trim(), rest),
            None => continue,
        };
        let irq = match irq.parse::<usize>() {
            Ok(irq) => irq,
            Err(_) => continue,
        };

        let mut fields = rest.split_whitespace().peekable();
        let mut count: u64 = 0;
        for _ in 0..nr_cols {
            match fields.peek().and_then(|f| f.parse::<u64>().ok()) {
                Some(v) => {
                    count = count.saturating_add(v);
                    fields.next();
                }
                None => break,
            }
        }
        let desc = fields.collect::<Vec<_>>().join(" ");

        irqs.push(InterruptCount { irq, count, desc });
    }

    Ok(irqs)
}

/// PCI address and kernel reported node per IRQ number.
fn scan_pci_devices(sys_root: &Path) -> Result<BTreeMap<usize, (String, Option<usize>)>> {
    let mut devices = BTreeMap::new();

    let pattern = sys_root.join("bus/pci/devices/*");
    for dev_path in glob(&pattern.to_string_lossy())?.filter_map(Result::ok) {
        let name = match dev_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        // -1 when the platform doesn't describe the device's locality.
        let node = read_from_file::<i64>(&dev_path.join("numa_node"))
            .ok()
            .and_then(|n| usize::try_from(n).ok());

        let mut dev_irqs = vec![];
        if let Ok(irq) = read_from_file::<usize>(&dev_path.join("irq")) {
            if irq != 0 {
                dev_irqs.push(irq);
            }
        }
        if let Ok(entries) = std::fs::read_dir(dev_path.join("msi_irqs")) {
            for entry in entries.filter_map(Result::ok) {
                if let Ok(irq) = entry.file_name().to_string_lossy().parse::<usize>() {
                    dev_irqs.push(irq);
                }
            }
        }

        for irq in dev_irqs {
            devices.insert(irq, (name.clone(), node));
        }
    }

    Ok(devices)
}

fn read_affinity(irq_dir: &Path) -> Option<(Cpumask, bool)> {
    let path = irq_dir.join("smp_affinity");
    let content = std::fs::read_to_string(&path).ok()?;
    let mask = match Cpumask::from_str(content.trim()) {
        Ok(mask) => mask,
        Err(e) => {
            warn!("Invalid affinity in {:?}: {:#}", path, e);
            return None;
        }
    };
    let writable = std::fs::metadata(&path)
        .map(|md| !md.permissions().readonly())
        .unwrap_or(false);

    Some((mask, writable))
}

#[derive(Debug, Clone)]
pub struct InterruptReader {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for InterruptReader {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptReader {
    pub fn new() -> InterruptReader {
        Self::with_roots(Path::new(PROCFS_ROOT), Path::new(crate::topology::SYSFS_ROOT))
    }

    pub fn with_roots(proc_root: &Path, sys_root: &Path) -> InterruptReader {
        InterruptReader {
            proc_root: proc_root.to_path_buf(),
            sys_root: sys_root.to_path_buf(),
        }
    }

    /// Read the current set of interrupts, ordered by number. Only the
    /// counters table is mandatory, per IRQ details are best effort.
    pub fn read(&self, pxm: &ProximityTable) -> Result<Vec<Interrupt>> {
        let path = self.proc_root.join("interrupts");
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let counts = parse_interrupts(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        let devices = match scan_pci_devices(&self.sys_root) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to scan PCI devices: {:#}", e);
                BTreeMap::new()
            }
        };

        let mut irqs = Vec::with_capacity(counts.len());
        for ic in counts {
            let mut irq = Interrupt::new(ic.irq, ic.count);
            irq.desc = ic.desc;

            let irq_dir = self.proc_root.join(format!("irq/{}", ic.irq));
            if let Some((mask, writable)) = read_affinity(&irq_dir) {
                irq.affinity = Some(mask);
                irq.affinity_writable = writable;
            }
            if let Some((dev, node)) = devices.get(&ic.irq) {
                irq.device = Some(dev.clone());
                irq.device_node = *node;
            }
            irq.pxm_node = pxm.lookup(irq.irq, irq.device.as_deref());

            irqs.push(irq);
        }
        irqs.sort_by_key(|irq| irq.irq);
        debug!("Read {} interrupts", irqs.len());

        Ok(irqs)
    }
}
