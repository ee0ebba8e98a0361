// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology
//!
//! A snapshot of the host's CPUs and NUMA nodes, as needed to place
//! interrupts:
//!
//! ```text
//!                      Topology
//!                         |
//!            o------------o------------o
//!            |                         |
//!   o--------o--------o       o--------o--------o
//!   | Node            |  ...  | Node            |
//!   | ID    0         |       | ID    1         |
//!   | Span  0x0f0f    |       | Span  0xf0f0    |
//!   o-----------------o       o-----------------o
//!            |
//!   o--------o--------o
//!   | Cpu             |
//!   | ID     9        |
//!   | Node   0        |
//!   | Core   1        |
//!   | Online 1        |
//!   o-----------------o
//! ```
//!
//! Every possible CPU is listed, online or not. A Cpu's core is the lowest
//! CPU id among its hyperthread siblings, so all threads of one physical core
//! share the same core id.
//!
//! Creating Topology
//! -----------------
//!
//!```no_run
//!     use birq_utils::Topology;
//!     let top = Topology::new().unwrap();
//!     for (id, node) in top.nodes() {
//!         println!("node {} cpus {}", id, node.span());
//!     }
//!```
//!
//! Topology objects are read-only. If the host topology changes (hotplug),
//! a new one should be created, which is cheap.

use crate::misc::read_cpulist_file;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::path::Path;

pub const SYSFS_ROOT: &str = "/sys";

#[derive(Debug, Clone, PartialEq)]
pub struct Cpu {
    id: usize,
    node: usize,
    core: usize,
    online: bool,
}

impl Cpu {
    pub fn new(id: usize, node: usize, core: usize, online: bool) -> Cpu {
        Cpu {
            id,
            node,
            core,
            online,
        }
    }

    /// Get the ID of this Cpu
    pub fn id(&self) -> usize {
        self.id
    }

    /// NUMA node this CPU belongs to
    pub fn node(&self) -> usize {
        self.node
    }

    /// Hyperthread sibling group
    pub fn core(&self) -> usize {
        self.core
    }

    /// Is this CPU online?
    pub fn online(&self) -> bool {
        self.online
    }

    /// Whether this is the first hardware thread of its core.
    pub fn is_primary_thread(&self) -> bool {
        self.id == self.core
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: usize,
    span: Cpumask,
}

impl Node {
    /// Get the ID of this NUMA node
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all CPUs in this NUMA node
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeMap<usize, Node>,
    cpus: BTreeMap<usize, Cpu>,
    nr_cpu_ids: usize,
    span: Cpumask,
}

impl Topology {
    /// Build a complete host Topology
    pub fn new() -> Result<Topology> {
        Self::from_sysfs(Path::new(SYSFS_ROOT))
    }

    /// Build a Topology from a sysfs tree mounted at @root.
    pub fn from_sysfs(root: &Path) -> Result<Topology> {
        let cpu_dir = root.join("devices/system/cpu");
        let possible = read_cpulist_file(&cpu_dir.join("possible"))
            .context("Failed to read possible CPUs")?;
        // Kernels without hotplug support may not expose the online list.
        let online = match read_cpulist_file(&cpu_dir.join("online")) {
            Ok(online) => online,
            Err(e) => {
                debug!("No online CPU list ({e:#}), assuming all possible CPUs are online");
                possible.clone()
            }
        };
        let online: Cpumask = online.into_iter().collect();
        let cpu_nodes = scan_numa_nodes(root)?;

        let mut cpus = Vec::with_capacity(possible.len());
        for cpu_id in possible {
            // Offline CPUs have no topology directory, they form their own
            // sibling group.
            let siblings = cpu_dir.join(format!("cpu{cpu_id}/topology/thread_siblings_list"));
            let core = read_cpulist_file(&siblings)
                .ok()
                .and_then(|s| s.into_iter().min())
                .unwrap_or(cpu_id);
            let node = cpu_nodes.get(&cpu_id).copied().unwrap_or(0);

            cpus.push(Cpu::new(cpu_id, node, core, online.test_cpu(cpu_id)));
        }

        Self::from_cpus(cpus)
    }

    /// Assemble a Topology from already known CPUs. NUMA nodes are derived
    /// from the CPUs' node ids.
    pub fn from_cpus(cpus: Vec<Cpu>) -> Result<Topology> {
        let mut nodes: BTreeMap<usize, Node> = BTreeMap::new();
        let mut cpu_map = BTreeMap::new();
        let mut span = Cpumask::new();

        for cpu in cpus {
            let node = nodes.entry(cpu.node).or_insert_with(|| Node {
                id: cpu.node,
                span: Cpumask::new(),
            });
            node.span.set_cpu(cpu.id)?;
            if cpu.online {
                span.set_cpu(cpu.id)?;
            }
            if let Some(dup) = cpu_map.insert(cpu.id, cpu) {
                bail!("Found duplicate CPU ID {}", dup.id);
            }
        }

        let nr_cpu_ids = cpu_map.keys().next_back().map_or(0, |id| id + 1);

        Ok(Topology {
            nodes,
            cpus: cpu_map,
            nr_cpu_ids,
            span,
        })
    }

    /// Get the map of NUMA nodes on the host.
    pub fn nodes(&self) -> &BTreeMap<usize, Node> {
        &self.nodes
    }

    /// Get a map of <CPU ID, Cpu> for all possible Cpus on the host.
    pub fn cpus(&self) -> &BTreeMap<usize, Cpu> {
        &self.cpus
    }

    pub fn cpu(&self, id: usize) -> Option<&Cpu> {
        self.cpus.get(&id)
    }

    pub fn node(&self, id: usize) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// One past the highest possible CPU id.
    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    /// Get a cpumask of all the online CPUs on the host
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

/// Map each CPU to its NUMA node. Kernels built without CONFIG_NUMA have no
/// node directories, in which case everything lands on node 0.
fn scan_numa_nodes(root: &Path) -> Result<BTreeMap<usize, usize>> {
    let mut cpu_nodes = BTreeMap::new();

    let pattern = root.join("devices/system/node/node[0-9]*");
    let numa_paths = glob(&pattern.to_string_lossy())?;
    for numa_path in numa_paths.filter_map(Result::ok) {
        let name = numa_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let node_id = match sscanf!(name.as_str(), "node{usize}") {
            Ok(val) => val,
            Err(_) => {
                bail!("Failed to parse NUMA node ID {}", name);
            }
        };

        for cpu_id in read_cpulist_file(&numa_path.join("cpulist"))? {
            if let Some(prev) = cpu_nodes.insert(cpu_id, node_id) {
                bail!("CPU {} listed in both node {} and node {}", cpu_id, prev, node_id);
            }
        }
    }

    Ok(cpu_nodes)
}
