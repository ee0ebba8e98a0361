// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Proximity table
//!
//! Administrator supplied NUMA locality for interrupts whose device the
//! kernel places on the wrong node, or on no node at all. The file holds one
//! entry per line:
//!
//!```text
//!     # comments and blank lines are ignored
//!     irq 42 1
//!     pxm 0000:3b 1
//!     pxm 0000:5e:00.0 0
//!```
//!
//! `irq` entries match an interrupt number. `pxm` entries match the PCI
//! address of the device raising the interrupt by prefix, so a bus or a
//! domain can be covered with a single line. Explicit `irq` entries win over
//! `pxm` entries and the longest matching prefix wins among `pxm` entries.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityKey {
    Irq(usize),
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityEntry {
    pub key: ProximityKey,
    pub node: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProximityTable {
    irqs: BTreeMap<usize, usize>,
    devices: Vec<(String, usize)>,
}

impl ProximityTable {
    pub fn new() -> ProximityTable {
        Self::default()
    }

    /// Parse the textual table. Any malformed line fails the whole table.
    pub fn parse(content: &str) -> Result<ProximityTable> {
        let mut table = ProximityTable::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                bail!("line {}: expected 3 fields, got {:?}", lineno + 1, line);
            }
            let node = match sscanf!(fields[2], "{usize}") {
                Ok(node) => node,
                Err(_) => bail!("line {}: invalid NUMA node {:?}", lineno + 1, fields[2]),
            };

            match fields[0] {
                "irq" => {
                    let irq = match sscanf!(fields[1], "{usize}") {
                        Ok(irq) => irq,
                        Err(_) => bail!("line {}: invalid IRQ {:?}", lineno + 1, fields[1]),
                    };
                    table.irqs.insert(irq, node);
                }
                "pxm" => {
                    let prefix = fields[1].to_lowercase();
                    match table.devices.iter_mut().find(|(p, _)| *p == prefix) {
                        Some(entry) => entry.1 = node,
                        None => table.devices.push((prefix, node)),
                    }
                }
                kind => bail!("line {}: unknown entry type {:?}", lineno + 1, kind),
            }
        }

        // Longest prefix first so lookup can stop at the first match.
        table
            .devices
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(table)
    }

    pub fn load(path: &Path) -> Result<ProximityTable> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proximity file {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid proximity file {:?}", path))
    }

    /// Drop entries pointing at nodes which don't exist on this host.
    pub fn retain_nodes(&mut self, is_valid: impl Fn(usize) -> bool) {
        self.irqs.retain(|irq, node| {
            let keep = is_valid(*node);
            if !keep {
                warn!("Ignoring proximity entry for IRQ {}: no NUMA node {}", irq, node);
            }
            keep
        });
        self.devices.retain(|(prefix, node)| {
            let keep = is_valid(*node);
            if !keep {
                warn!("Ignoring proximity entry for {}: no NUMA node {}", prefix, node);
            }
            keep
        });
    }

    pub fn lookup(&self, irq: usize, device: Option<&str>) -> Option<usize> {
        if let Some(node) = self.irqs.get(&irq) {
            return Some(*node);
        }
        let device = device?.to_lowercase();
        self.devices
            .iter()
            .find(|(prefix, _)| device.starts_with(prefix.as_str()))
            .map(|(_, node)| *node)
    }

    pub fn len(&self) -> usize {
        self.irqs.len() + self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<ProximityEntry> {
        self.irqs
            .iter()
            .map(|(irq, node)| ProximityEntry {
                key: ProximityKey::Irq(*irq),
                node: *node,
            })
            .chain(self.devices.iter().map(|(prefix, node)| ProximityEntry {
                key: ProximityKey::Device(prefix.clone()),
                node: *node,
            }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "
# NIC on the second socket
irq 42 1
pxm 0000:3b 1
pxm 0000:3b:00.1 0   # except this function
PXM 0000:5E 0
";

    #[test]
    fn test_parse_and_lookup() {
        let table = ProximityTable::parse(&TABLE.replace("PXM", "pxm")).unwrap();
        assert_eq!(table.len(), 4);

        assert_eq!(table.lookup(42, None), Some(1));
        assert_eq!(table.lookup(42, Some("0000:3b:00.1")), Some(1));
        assert_eq!(table.lookup(7, Some("0000:3b:00.0")), Some(1));
        assert_eq!(table.lookup(7, Some("0000:3b:00.1")), Some(0));
        assert_eq!(table.lookup(7, Some("0000:5e:00.0")), Some(0));
        assert_eq!(table.lookup(7, Some("0000:af:00.0")), None);
        assert_eq!(table.lookup(7, None), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ProximityTable::parse("PXM 0000:5e 0").is_err());
        assert!(ProximityTable::parse("irq 42").is_err());
        assert!(ProximityTable::parse("irq x 1").is_err());
        assert!(ProximityTable::parse("irq 1 -1").is_err());
        assert!(ProximityTable::parse("# nothing\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_retain_nodes() {
        let mut table = ProximityTable::parse("irq 1 0\nirq 2 3\npxm 0000:3b 3\n").unwrap();
        table.retain_nodes(|node| node < 2);
        assert_eq!(
            table.entries(),
            vec![ProximityEntry {
                key: ProximityKey::Irq(1),
                node: 0
            }]
        );
    }
}
