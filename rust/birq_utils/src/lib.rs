// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host interfaces for the birq interrupt balancer
//!
//! birq periodically moves hardware interrupts off overloaded CPUs. The
//! decisions are made by the daemon itself; this crate holds the pieces which
//! talk to the kernel, each of which can be pointed at a fake `/proc` or
//! `/sys` tree for testing.
//!
//! - `Cpumask`: a set of CPU ids in the kernel's hexadecimal and cpulist
//!   formats.
//! - `Topology`: possible and online CPUs, their NUMA nodes and hyperthread
//!   siblings.
//! - `InterruptReader`: numbered interrupts with their counters, affinity
//!   and the PCI device raising them.
//! - `ProximityTable`: administrator overrides of interrupt NUMA locality.
//! - `AffinityWriter`: commits a new affinity for an interrupt.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::MAX_CPU_IDS;

mod topology;
pub use topology::Cpu;
pub use topology::Node;
pub use topology::Topology;
pub use topology::SYSFS_ROOT;

mod interrupts;
pub use interrupts::parse_interrupts;
pub use interrupts::Interrupt;
pub use interrupts::InterruptCount;
pub use interrupts::InterruptReader;
pub use interrupts::PROCFS_ROOT;

mod proximity;
pub use proximity::ProximityEntry;
pub use proximity::ProximityKey;
pub use proximity::ProximityTable;

mod affinity;
pub use affinity::is_refused;
pub use affinity::AffinityWriter;

pub mod misc;
