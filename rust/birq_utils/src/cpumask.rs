// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A set of CPU ids backed by a `BitVec` of u64's. Unlike the kernel's
//! fixed-width `cpumask_t`, a Cpumask grows as CPUs are added, so masks read
//! from different sources (sysfs cpulists, `/proc/irq/*/smp_affinity`,
//! configuration) can be combined without knowing `nr_cpu_ids` up front.
//! Operations which need a width (complement) take it explicitly.
//!
//! Cpumasks can be parsed from the kernel's hexadecimal format, including
//! the comma separated 32bit groups used by `smp_affinity`:
//!
//!```
//!     use birq_utils::Cpumask;
//!     let mask = Cpumask::from_str("00000000,0000000f").unwrap();
//!     assert_eq!(mask.weight(), 4);
//!     assert_eq!(format!("{:x}", mask), "f");
//!```
//!
//! or from a cpulist such as `0-3,8`:
//!
//!```
//!     use birq_utils::Cpumask;
//!     let mut mask = Cpumask::from_cpulist("0-3,8").unwrap();
//!     assert!(mask.test_cpu(8));
//!     mask.clear_cpu(8).unwrap();
//!     assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

/// Upper bound on CPU ids accepted by a Cpumask. Matches the largest
/// CONFIG_NR_CPUS the kernel can be built with.
pub const MAX_CPU_IDS: usize = 8192;

#[derive(Debug, Clone, Default)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(cpu: usize) -> Result<()> {
        if cpu >= MAX_CPU_IDS {
            bail!("Invalid CPU {} passed, max {}", cpu, MAX_CPU_IDS);
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: BitVec::new(),
        }
    }

    /// Build a Cpumask with CPUs [0, nr_cpus) set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus.min(MAX_CPU_IDS)],
        }
    }

    /// Build a Cpumask object from a hexadecimal string. Commas and
    /// underscores are ignored, "none" yields an empty mask.
    pub fn from_str(cpumask: &str) -> Result<Cpumask> {
        let cpumask = cpumask.trim().trim_end_matches('\0');
        if cpumask == "none" {
            return Ok(Self::new());
        }

        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace([',', '_'], "");
            if tmp_str.is_empty() {
                bail!("Empty cpumask");
            }
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new();
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                mask.set_cpu(index * 8 + lsb)
                    .with_context(|| format!("Cpumask {cpumask} out of range"))?;
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from a cpulist, e.g. "0-3,8,10-11".
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.clear();
    }

    /// Set a bit in the Cpumask, growing it as needed. Returns an error if
    /// the CPU exceeds MAX_CPU_IDS.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        if cpu >= self.mask.len() {
            self.mask.resize(cpu + 1, false);
        }
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Lowest CPU in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Highest CPU in the mask.
    pub fn last(&self) -> Option<usize> {
        self.mask.last_one()
    }

    /// Complement of the mask among CPUs [0, nr_cpus).
    pub fn not_within(&self, nr_cpus: usize) -> Cpumask {
        let nr_cpus = nr_cpus.min(MAX_CPU_IDS);
        Cpumask {
            mask: (0..nr_cpus).map(|cpu| !self.test_cpu(cpu)).collect(),
        }
    }

    fn combine(&self, other: &Cpumask, op: impl Fn(bool, bool) -> bool) -> Cpumask {
        let width = self.mask.len().max(other.mask.len());
        Cpumask {
            mask: (0..width)
                .map(|cpu| op(self.test_cpu(cpu), other.test_cpu(cpu)))
                .collect(),
        }
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        self.combine(other, |a, b| a && b)
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        self.combine(other, |a, b| a || b)
    }

    /// Create a Cpumask with the CPUs of the current one that are not in
    /// @other.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        self.combine(other, |a, b| a && !b)
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        // Kernel bitmap format: 32bit groups, most significant first, the
        // leading group unpadded.
        let nr_groups = match self.last() {
            Some(cpu) => cpu / 32 + 1,
            None => 1,
        };
        let mut groups = vec![0u32; nr_groups];
        for cpu in self.iter() {
            groups[cpu / 32] |= 1 << (cpu % 32);
        }

        let mut groups = groups.iter().rev();
        if let Some(top) = groups.next() {
            match case {
                'x' => write!(f, "{top:x}")?,
                'X' => write!(f, "{top:X}")?,
                _ => unreachable!(),
            }
        }
        for submask in groups {
            match case {
                'x' => write!(f, ",{submask:08x}")?,
                'X' => write!(f, ",{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',').map(str::trim).filter(|g| !g.is_empty()) {
        let (min, max) = match sscanf!(group, "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group, "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group);
                }
            },
        };
        if min > max {
            bail!("Invalid cpulist range {}", group);
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl<'a> IntoIterator for &'a Cpumask {
    type Item = usize;
    type IntoIter = CpumaskIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<usize> for Cpumask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Cpumask::new();
        for cpu in iter {
            if cpu < MAX_CPU_IDS {
                let _ = mask.set_cpu(cpu);
            }
        }
        mask
    }
}

// Masks of different widths are equal when the same CPUs are set.
impl PartialEq for Cpumask {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for Cpumask {}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        *self = self.and(rhs);
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        *self = self.or(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_kernel_format() {
        let mask = Cpumask::from_str("00000001,00000003").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 32]);

        let mask = Cpumask::from_str("0xf0").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);

        assert!(Cpumask::from_str("none").unwrap().is_empty());
        assert!(Cpumask::from_str("").is_err());
        assert!(Cpumask::from_str("xyz").is_err());
    }

    #[test]
    fn test_display_roundtrips_through_kernel_format() {
        let mask = Cpumask::from_cpulist("0,33").unwrap();
        assert_eq!(format!("{mask}"), "2,00000001");
        assert_eq!(Cpumask::from_str(&mask.to_string()).unwrap(), mask);

        assert_eq!(format!("{}", Cpumask::new()), "0");
        assert_eq!(format!("{:X}", Cpumask::from_cpulist("10-11").unwrap()), "C00");
    }

    #[test]
    fn test_cpulist() {
        assert_eq!(read_cpulist("0-2,6-8").unwrap(), vec![0, 1, 2, 6, 7, 8]);
        assert_eq!(read_cpulist("3\n").unwrap(), vec![3]);
        assert!(read_cpulist("").unwrap().is_empty());
        assert!(read_cpulist("4-2").is_err());
        assert!(read_cpulist("a-b").is_err());
    }

    #[test]
    fn test_set_ops_ignore_width() {
        let a = Cpumask::from_cpulist("0-3").unwrap();
        let b = Cpumask::from_cpulist("2-9").unwrap();

        assert_eq!(a.and(&b), Cpumask::from_cpulist("2-3").unwrap());
        assert_eq!(a.or(&b), Cpumask::from_cpulist("0-9").unwrap());
        assert_eq!(b.and_not(&a), Cpumask::from_cpulist("4-9").unwrap());
        assert_eq!(a.not_within(6), Cpumask::from_cpulist("4-5").unwrap());

        let mut c = a.clone();
        c |= &b;
        c &= &Cpumask::from_cpulist("1,9").unwrap();
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![1, 9]);
    }

    #[test]
    fn test_bounds() {
        let mut mask = Cpumask::new();
        assert!(mask.set_cpu(MAX_CPU_IDS).is_err());
        assert!(mask.clear_cpu(100).is_ok());
        assert!(!mask.test_cpu(100));
        assert_eq!(mask.first(), None);

        mask.set_cpu(7).unwrap();
        mask.set_cpu(3).unwrap();
        assert_eq!(mask.first(), Some(3));
        assert_eq!(mask.last(), Some(7));
        assert_eq!(mask.weight(), 2);

        mask.clear_all();
        assert!(mask.is_empty());
        assert_eq!(Cpumask::full(4).weight(), 4);
    }
}
