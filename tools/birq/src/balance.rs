// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # birq load balancer
//!
//! Decides which interrupts move where. The balancer never touches the
//! kernel, it only turns a view of CPU loads and interrupt rates into a list
//! of relocations which the caller commits.
//!
//! Load Balancing
//! --------------
//!
//! Each IRQ is attributed to one CPU, its owner, which is the lowest online
//! CPU in its affinity. Balancing then proceeds as follows:
//!
//! 1. Every online, non excluded CPU with a valid load above the threshold
//!    becomes a source. Sources are visited from the most to the least
//!    loaded.
//!
//! 2. For each source, the movable IRQs it owns which were already seen in
//!    an earlier cycle and which fired since then are the candidates. The
//!    configured strategy picks exactly one of them:
//!
//!    - max: highest rate
//!    - min: lowest rate
//!    - rnd: any, uniformly
//!
//! 3. The picked IRQ goes to the least loaded eligible CPU, preferring the
//!    one with fewer IRQs and then the lower id on ties:
//!
//!    ```text
//!                o--------------------------------------o
//!                |           eligible destination       |
//!                |                                      |
//!                | online, not excluded, not the owner  |
//!                | on the IRQ's home node               |
//!                |   (unless non-local CPUs are allowed |
//!                |    or the home node is unknown)      |
//!                | first thread of its core             |
//!                |   (unless hyperthreads are used)     |
//!                o--------------------------------------o
//!    ```
//!
//!    The move only happens if the destination stays under the load limit
//!    with the IRQ's estimated load added. The estimate is the owner's IRQ
//!    load, split among the IRQs it owns in proportion to their rates. Once
//!    accepted, the estimate is added to the destination so later decisions
//!    in the same cycle see it.
//!
//! 4. Finally, IRQs seen for the first time whose affinity still spans
//!    several CPUs are placed on a single CPU with the same destination
//!    rule.
//!
//! Moving a single IRQ per overloaded CPU per cycle keeps the balancer from
//! oscillating. A CPU which stays overloaded gets another IRQ moved off in
//! the next cycle.

use core::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use anyhow::bail;
use anyhow::Result;
use birq_utils::Cpumask;
use clap::ValueEnum;
use log::debug;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use sorted_vec::SortedVec;

/// How to pick the IRQ to move off an overloaded CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Highest interrupt rate first
    Max,
    /// Lowest interrupt rate first
    Min,
    /// Uniformly random
    #[default]
    Rnd,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Max => write!(f, "max"),
            Strategy::Min => write!(f, "min"),
            Strategy::Rnd => write!(f, "rnd"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max" => Ok(Strategy::Max),
            "min" => Ok(Strategy::Min),
            "rnd" => Ok(Strategy::Rnd),
            _ => bail!("Unknown strategy {:?}, expected max, min or rnd", s),
        }
    }
}

impl Strategy {
    /// Create the chooser implementing this strategy. @seed makes rnd
    /// reproducible.
    pub fn chooser(&self, seed: Option<u64>) -> Box<dyn Chooser> {
        match self {
            Strategy::Max => Box::new(MaxRate),
            Strategy::Min => Box::new(MinRate),
            Strategy::Rnd => Box::new(RandomPick::new(seed)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub irq: usize,
    pub rate: f64,
}

/// Picks one of the candidates of an overloaded CPU. Candidates are ordered
/// by IRQ number and never empty.
pub trait Chooser {
    fn choose(&mut self, candidates: &[Candidate]) -> usize;
}

pub struct MaxRate;

impl Chooser for MaxRate {
    fn choose(&mut self, candidates: &[Candidate]) -> usize {
        candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.rate.total_cmp(&b.rate).then_with(|| b.irq.cmp(&a.irq)))
            .map_or(0, |(idx, _)| idx)
    }
}

pub struct MinRate;

impl Chooser for MinRate {
    fn choose(&mut self, candidates: &[Candidate]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.rate.total_cmp(&b.rate).then_with(|| a.irq.cmp(&b.irq)))
            .map_or(0, |(idx, _)| idx)
    }
}

pub struct RandomPick {
    rng: StdRng,
}

impl RandomPick {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl Chooser for RandomPick {
    fn choose(&mut self, candidates: &[Candidate]) -> usize {
        if candidates.len() <= 1 {
            return 0;
        }
        self.rng.gen_range(0..candidates.len())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CpuState {
    pub id: usize,
    pub node: usize,
    /// Lowest CPU id among the hyperthread siblings.
    pub core: usize,
    pub online: bool,
    pub excluded: bool,
    pub load: f64,
    pub irq_load: f64,
    pub load_valid: bool,
}

impl CpuState {
    pub fn is_primary_thread(&self) -> bool {
        self.id == self.core
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IrqState {
    pub irq: usize,
    /// Affinity restricted to online CPUs.
    pub affinity: Cpumask,
    pub home_node: Option<usize>,
    pub rate: f64,
    pub movable: bool,
    /// First cycle this IRQ is seen.
    pub fresh: bool,
}

impl IrqState {
    pub fn owner(&self) -> Option<usize> {
        self.affinity.first()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BalanceParams {
    pub threshold: f64,
    pub load_limit: f64,
    pub non_local_cpus: bool,
    pub ht: bool,
    pub place_new_irqs: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// Moved off an overloaded CPU.
    Overload,
    /// First placement of an IRQ spread over several CPUs.
    Placement,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Overload => "overload",
            Reason::Placement => "placement",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relocation {
    pub irq: usize,
    pub from: usize,
    pub to: usize,
    pub reason: Reason,
}

impl fmt::Display for Relocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IRQ {} CPU {} --> CPU {} ({})",
            self.irq, self.from, self.to, self.reason
        )
    }
}

macro_rules! impl_ord_for_type {
    ($($t:ty),*) => {
        $(
            impl PartialEq for $t {
                fn eq(&self, other: &Self) -> bool {
                    self.cmp(other) == Ordering::Equal
                }
            }

            impl Eq for $t {}

            impl PartialOrd for $t {
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(self.cmp(other))
                }
            }

            impl Ord for $t {
                fn cmp(&self, other: &Self) -> Ordering {
                    self.get_load()
                        .cmp(&other.get_load())
                        .then_with(|| self.get_rank().cmp(&other.get_rank()))
                }
            }
        )*
    };
}

/// Sort order of the balancer's work lists: by load, then by rank.
trait LoadOrdered {
    type Rank: Ord;

    fn get_load(&self) -> OrderedFloat<f64>;
    fn get_rank(&self) -> Self::Rank;
}

#[derive(Debug)]
struct Source {
    id: usize,
    load: OrderedFloat<f64>,
}

impl LoadOrdered for Source {
    // Sources are walked in reverse, keep equally loaded ones in id order.
    type Rank = Reverse<usize>;

    fn get_load(&self) -> OrderedFloat<f64> {
        self.load
    }

    fn get_rank(&self) -> Reverse<usize> {
        Reverse(self.id)
    }
}

#[derive(Debug)]
struct Destination {
    id: usize,
    load: OrderedFloat<f64>,
    nr_irqs: usize,
}

impl LoadOrdered for Destination {
    type Rank = (usize, usize);

    fn get_load(&self) -> OrderedFloat<f64> {
        self.load
    }

    fn get_rank(&self) -> (usize, usize) {
        (self.nr_irqs, self.id)
    }
}

impl_ord_for_type!(Source, Destination);

pub struct LoadBalancer<'a> {
    params: &'a BalanceParams,
    irqs: &'a BTreeMap<usize, IrqState>,

    /// Working copy, destinations accumulate the estimates moved onto them.
    cpus: BTreeMap<usize, CpuState>,
    nr_irqs: BTreeMap<usize, usize>,
    owner_rates: BTreeMap<usize, f64>,

    sources: SortedVec<Source>,
}

impl<'a> LoadBalancer<'a> {
    pub fn new(
        params: &'a BalanceParams,
        cpus: &BTreeMap<usize, CpuState>,
        irqs: &'a BTreeMap<usize, IrqState>,
    ) -> Self {
        let mut nr_irqs = BTreeMap::new();
        let mut owner_rates = BTreeMap::new();
        for irq in irqs.values() {
            if let Some(owner) = irq.owner() {
                *nr_irqs.entry(owner).or_insert(0) += 1;
                *owner_rates.entry(owner).or_insert(0.0) += irq.rate;
            }
        }

        let mut sources = SortedVec::new();
        for cpu in cpus.values() {
            if cpu.online && !cpu.excluded && cpu.load_valid && cpu.load > params.threshold {
                sources.insert(Source {
                    id: cpu.id,
                    load: OrderedFloat(cpu.load),
                });
            }
        }

        Self {
            params,
            irqs,
            cpus: cpus.clone(),
            nr_irqs,
            owner_rates,
            sources,
        }
    }

    /// CPUs above the threshold, most loaded first.
    pub fn overloaded(&self) -> Vec<usize> {
        self.sources.iter().rev().map(|s| s.id).collect()
    }

    /// Decide this cycle's relocations.
    pub fn load_balance(&mut self, chooser: &mut dyn Chooser) -> Vec<Relocation> {
        let mut relocations = vec![];

        debug!(
            "Overload LB started ({} overloaded CPUs, threshold {:.2})",
            self.sources.len(),
            self.params.threshold
        );
        let sources = self.overloaded();
        for src in sources {
            if let Some(reloc) = self.balance_source(src, chooser) {
                relocations.push(reloc);
            }
        }

        if self.params.place_new_irqs {
            self.place_new_irqs(&mut relocations);
        }

        relocations
    }

    fn balance_source(&mut self, src: usize, chooser: &mut dyn Chooser) -> Option<Relocation> {
        let candidates: Vec<Candidate> = self
            .irqs
            .values()
            .filter(|irq| irq.owner() == Some(src) && irq.movable && !irq.fresh && irq.rate > 0.0)
            .map(|irq| Candidate {
                irq: irq.irq,
                rate: irq.rate,
            })
            .collect();
        if candidates.is_empty() {
            debug!("  CPU {} has no movable IRQs", src);
            return None;
        }

        let picked = candidates[chooser.choose(&candidates).min(candidates.len() - 1)];
        let irq = match self.irqs.get(&picked.irq) {
            Some(irq) => irq,
            None => return None,
        };
        let owner = match self.cpus.get(&src) {
            Some(owner) => owner,
            None => {
                debug!("  IRQ {} owner CPU {} vanished", picked.irq, src);
                return None;
            }
        };

        let owner_rate = self.owner_rates.get(&src).copied().unwrap_or(0.0);
        let estimate = if owner_rate > 0.0 {
            owner.irq_load * picked.rate / owner_rate
        } else {
            0.0
        };

        let dst = self.find_destination(irq, Some(src), estimate)?;
        self.account(dst, estimate);

        debug!(
            "  CPU {} sending IRQ {} (rate: {:.2}/s, load: {:.2}) --> CPU {}",
            src, picked.irq, picked.rate, estimate, dst
        );
        Some(Relocation {
            irq: picked.irq,
            from: src,
            to: dst,
            reason: Reason::Overload,
        })
    }

    fn place_new_irqs(&mut self, relocations: &mut Vec<Relocation>) {
        let irqs = self.irqs;
        for irq in irqs.values() {
            if !irq.fresh || !irq.movable || irq.affinity.weight() <= 1 {
                continue;
            }
            let from = match irq.owner() {
                Some(from) => from,
                None => continue,
            };

            if let Some(dst) = self.find_destination(irq, None, 0.0) {
                self.account(dst, 0.0);
                debug!("  Placing new IRQ {} ({}) --> CPU {}", irq.irq, irq.affinity, dst);
                relocations.push(Relocation {
                    irq: irq.irq,
                    from,
                    to: dst,
                    reason: Reason::Placement,
                });
            }
        }
    }

    fn is_eligible(&self, cpu: &CpuState, irq: &IrqState, owner: Option<usize>) -> bool {
        if !cpu.online || cpu.excluded || Some(cpu.id) == owner {
            return false;
        }
        if !self.params.ht && !cpu.is_primary_thread() {
            return false;
        }
        match irq.home_node {
            Some(node) if !self.params.non_local_cpus => cpu.node == node,
            _ => true,
        }
    }

    fn find_destination(&self, irq: &IrqState, owner: Option<usize>, estimate: f64) -> Option<usize> {
        let mut dests = SortedVec::new();
        for cpu in self.cpus.values() {
            if self.is_eligible(cpu, irq, owner) {
                dests.insert(Destination {
                    id: cpu.id,
                    load: OrderedFloat(cpu.load),
                    nr_irqs: self.nr_irqs.get(&cpu.id).copied().unwrap_or(0),
                });
            }
        }

        // The least loaded CPU is the only one worth checking against the
        // limit.
        match dests.first() {
            Some(dst) if *dst.load + estimate < self.params.load_limit => Some(dst.id),
            Some(dst) => {
                debug!(
                    "  No room for IRQ {}: CPU {} at {:.2} + {:.2} >= {:.2}",
                    irq.irq, dst.id, *dst.load, estimate, self.params.load_limit
                );
                None
            }
            None => {
                debug!("  No eligible destination for IRQ {}", irq.irq);
                None
            }
        }
    }

    fn account(&mut self, dst: usize, estimate: f64) {
        if let Some(cpu) = self.cpus.get_mut(&dst) {
            cpu.load += estimate;
        }
        *self.nr_irqs.entry(dst).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(id: usize, node: usize, load: f64) -> CpuState {
        CpuState {
            id,
            node,
            core: id,
            online: true,
            excluded: false,
            load,
            irq_load: 10.0,
            load_valid: true,
        }
    }

    fn irq(irq: usize, owner: usize, rate: f64, home_node: Option<usize>) -> IrqState {
        IrqState {
            irq,
            affinity: Cpumask::from_cpulist(&owner.to_string()).unwrap(),
            home_node,
            rate,
            movable: true,
            fresh: false,
        }
    }

    fn params(threshold: f64, load_limit: f64) -> BalanceParams {
        BalanceParams {
            threshold,
            load_limit,
            non_local_cpus: false,
            ht: true,
            place_new_irqs: true,
        }
    }

    fn cpu_map(cpus: Vec<CpuState>) -> BTreeMap<usize, CpuState> {
        cpus.into_iter().map(|c| (c.id, c)).collect()
    }

    fn irq_map(irqs: Vec<IrqState>) -> BTreeMap<usize, IrqState> {
        irqs.into_iter().map(|i| (i.irq, i)).collect()
    }

    fn run(
        params: &BalanceParams,
        cpus: &BTreeMap<usize, CpuState>,
        irqs: &BTreeMap<usize, IrqState>,
        strategy: Strategy,
    ) -> Vec<Relocation> {
        let mut chooser = strategy.chooser(Some(42));
        LoadBalancer::new(params, cpus, irqs).load_balance(chooser.as_mut())
    }

    #[test]
    fn test_strategies() {
        let cands = [
            Candidate { irq: 1, rate: 5.0 },
            Candidate { irq: 2, rate: 20.0 },
            Candidate { irq: 3, rate: 12.0 },
        ];
        assert_eq!(MaxRate.choose(&cands), 1);
        assert_eq!(MinRate.choose(&cands), 0);

        let ties = [
            Candidate { irq: 7, rate: 3.0 },
            Candidate { irq: 9, rate: 3.0 },
        ];
        assert_eq!(MaxRate.choose(&ties), 0);
        assert_eq!(MinRate.choose(&ties), 0);

        let mut rnd = RandomPick::new(Some(1));
        for _ in 0..32 {
            assert!(rnd.choose(&cands) < cands.len());
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("max".parse::<Strategy>().unwrap(), Strategy::Max);
        assert_eq!("rnd".parse::<Strategy>().unwrap(), Strategy::Rnd);
        assert!("random".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Min.to_string(), "min");
        assert_eq!(Strategy::default(), Strategy::Rnd);
    }

    #[test]
    fn test_relocate_to_idle_cpu() {
        let p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 85.0), cpu(1, 0, 10.0)]);
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);

        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(
            relocs,
            vec![Relocation {
                irq: 42,
                from: 0,
                to: 1,
                reason: Reason::Overload
            }]
        );
    }

    #[test]
    fn test_destination_over_limit() {
        let p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 85.0), cpu(1, 0, 55.0)]);
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);

        assert!(run(&p, &cpus, &irqs, Strategy::Max).is_empty());
    }

    #[test]
    fn test_estimate_counts_against_limit() {
        let p = params(70.0, 50.0);
        // IRQ 42 carries all of CPU 0's 10% IRQ load, 44 + 10 is over.
        let cpus = cpu_map(vec![cpu(0, 0, 85.0), cpu(1, 0, 44.0)]);
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);
        assert!(run(&p, &cpus, &irqs, Strategy::Max).is_empty());

        // Sharing it with another IRQ halves the estimate.
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0)), irq(43, 0, 30.0, Some(0))]);
        assert_eq!(run(&p, &cpus, &irqs, Strategy::Max).len(), 1);
    }

    #[test]
    fn test_numa_locality() {
        let mut p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 85.0), cpu(1, 1, 10.0)]);
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);
        assert!(run(&p, &cpus, &irqs, Strategy::Max).is_empty());

        p.non_local_cpus = true;
        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].to, 1);

        // Unknown home node doesn't restrict.
        p.non_local_cpus = false;
        let irqs = irq_map(vec![irq(42, 0, 30.0, None)]);
        assert_eq!(run(&p, &cpus, &irqs, Strategy::Max)[0].to, 1);
    }

    #[test]
    fn test_excluded_and_offline_destinations() {
        let p = params(70.0, 50.0);
        let mut cpus = cpu_map(vec![
            cpu(0, 0, 85.0),
            cpu(1, 0, 5.0),
            cpu(2, 0, 6.0),
            cpu(3, 0, 20.0),
        ]);
        cpus.get_mut(&1).unwrap().excluded = true;
        cpus.get_mut(&2).unwrap().online = false;
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);

        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].to, 3);
    }

    #[test]
    fn test_one_relocation_per_source() {
        let p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 95.0), cpu(1, 0, 10.0), cpu(2, 0, 10.0)]);
        let irqs = irq_map(vec![
            irq(40, 0, 5.0, Some(0)),
            irq(41, 0, 20.0, Some(0)),
            irq(42, 0, 12.0, Some(0)),
        ]);

        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].irq, 41);

        let relocs = run(&p, &cpus, &irqs, Strategy::Min);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].irq, 40);
    }

    #[test]
    fn test_sources_share_destinations() {
        let p = params(70.0, 60.0);
        let mut cpus = cpu_map(vec![
            cpu(0, 0, 95.0),
            cpu(1, 0, 90.0),
            cpu(2, 0, 30.0),
            cpu(3, 0, 45.0),
        ]);
        cpus.get_mut(&0).unwrap().irq_load = 20.0;
        cpus.get_mut(&1).unwrap().irq_load = 20.0;
        let irqs = irq_map(vec![irq(10, 0, 100.0, Some(0)), irq(11, 1, 100.0, Some(0))]);

        // CPU 0 is handled first and fills CPU 2 up to 50. CPU 1's IRQ then
        // looks at CPU 3 which has no room for another 20.
        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(relocs.len(), 1);
        assert_eq!((relocs[0].irq, relocs[0].from, relocs[0].to), (10, 0, 2));

        cpus.get_mut(&3).unwrap().load = 20.0;
        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(relocs.len(), 2);
        assert_eq!((relocs[0].irq, relocs[0].to), (10, 3));
        assert_eq!((relocs[1].irq, relocs[1].to), (11, 2));
    }

    #[test]
    fn test_destination_tie_break() {
        let p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 95.0), cpu(1, 0, 10.0), cpu(2, 0, 10.0)]);
        let irqs = irq_map(vec![
            irq(42, 0, 30.0, Some(0)),
            irq(43, 1, 0.0, Some(0)),
        ]);

        // Same load, CPU 2 has fewer IRQs.
        assert_eq!(run(&p, &cpus, &irqs, Strategy::Max)[0].to, 2);
    }

    #[test]
    fn test_hyperthreads() {
        let mut p = params(70.0, 50.0);
        let mut cpus = cpu_map(vec![cpu(0, 0, 95.0), cpu(1, 0, 30.0), cpu(2, 0, 5.0)]);
        cpus.get_mut(&2).unwrap().core = 0;
        let irqs = irq_map(vec![irq(42, 0, 30.0, Some(0))]);

        assert_eq!(run(&p, &cpus, &irqs, Strategy::Max)[0].to, 2);
        p.ht = false;
        assert_eq!(run(&p, &cpus, &irqs, Strategy::Max)[0].to, 1);
    }

    #[test]
    fn test_non_candidates() {
        let p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 95.0), cpu(1, 0, 10.0)]);

        let mut pinned = irq(40, 0, 50.0, Some(0));
        pinned.movable = false;
        let mut fresh = irq(41, 0, 50.0, Some(0));
        fresh.fresh = true;
        let quiet = irq(42, 0, 0.0, Some(0));
        let irqs = irq_map(vec![pinned, fresh, quiet]);

        assert!(run(&p, &cpus, &irqs, Strategy::Rnd).is_empty());
    }

    #[test]
    fn test_sources() {
        let p = params(70.0, 50.0);
        let mut cpus = cpu_map(vec![
            cpu(0, 0, 80.0),
            cpu(1, 0, 90.0),
            cpu(2, 0, 80.0),
            cpu(3, 0, 99.0),
            cpu(4, 0, 99.0),
            cpu(5, 0, 70.0),
        ]);
        cpus.get_mut(&3).unwrap().excluded = true;
        cpus.get_mut(&4).unwrap().load_valid = false;

        let irqs = BTreeMap::new();
        let lb = LoadBalancer::new(&p, &cpus, &irqs);
        assert_eq!(lb.overloaded(), vec![1, 0, 2]);

        let p = params(90.0, 50.0);
        let lb = LoadBalancer::new(&p, &cpus, &irqs);
        assert!(lb.overloaded().is_empty());
    }

    #[test]
    fn test_place_new_irqs() {
        let mut p = params(70.0, 50.0);
        let cpus = cpu_map(vec![cpu(0, 0, 30.0), cpu(1, 0, 20.0), cpu(2, 1, 0.0)]);
        let mut spread = irq(50, 0, 0.0, Some(0));
        spread.affinity = Cpumask::from_cpulist("0-2").unwrap();
        spread.fresh = true;
        let mut single = irq(51, 0, 0.0, Some(0));
        single.fresh = true;
        let irqs = irq_map(vec![spread, single]);

        let relocs = run(&p, &cpus, &irqs, Strategy::Max);
        assert_eq!(
            relocs,
            vec![Relocation {
                irq: 50,
                from: 0,
                to: 1,
                reason: Reason::Placement
            }]
        );

        p.place_new_irqs = false;
        assert!(run(&p, &cpus, &irqs, Strategy::Max).is_empty());
    }

    #[test]
    fn test_idempotent() {
        let p = params(70.0, 90.0);
        let cpus = cpu_map((0..8).map(|i| cpu(i, i / 4, 10.0 * i as f64 + 15.0)).collect());
        let irqs = irq_map(
            (0..32)
                .map(|i| irq(100 + i, i % 8, (i * 7 % 13) as f64 + 1.0, Some(i % 2)))
                .collect(),
        );

        for strategy in [Strategy::Max, Strategy::Min, Strategy::Rnd] {
            let first = run(&p, &cpus, &irqs, strategy);
            let second = run(&p, &cpus, &irqs, strategy);
            assert!(!first.is_empty());
            assert_eq!(first, second);
            for reloc in first.iter() {
                let dst = &cpus[&reloc.to];
                assert!(dst.online && !dst.excluded);
                assert_eq!(Some(dst.node), irqs[&reloc.irq].home_node);
            }
        }
    }
}
