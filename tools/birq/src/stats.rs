// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Load and rate statistics
//!
//! Turns two snapshots of the host's counters into per CPU load percentages
//! and per interrupt rates. Everything here is a pure function of the two
//! snapshots and the time elapsed between them.

use std::collections::BTreeMap;
use std::time::Duration;

use ::fb_procfs as procfs;

pub fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    if let Some(res) = curr.checked_sub(*prev) {
        res
    } else {
        0
    }
}

/// Cumulative time a CPU spent in each state, in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub stolen: u64,
}

impl CpuTimes {
    /// None if the kernel didn't report one of the fields we rely on.
    pub fn from_procfs(stat: &procfs::CpuStat) -> Option<CpuTimes> {
        match stat {
            procfs::CpuStat {
                user_usec: Some(user),
                nice_usec: Some(nice),
                system_usec: Some(system),
                idle_usec: Some(idle),
                iowait_usec: Some(iowait),
                irq_usec: Some(irq),
                softirq_usec: Some(softirq),
                stolen_usec: Some(stolen),
                ..
            } => Some(CpuTimes {
                user: *user,
                nice: *nice,
                system: *system,
                idle: *idle,
                iowait: *iowait,
                irq: *irq,
                softirq: *softirq,
                stolen: *stolen,
            }),
            _ => None,
        }
    }

    fn delta(&self, prev: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: sub_or_zero(&self.user, &prev.user),
            nice: sub_or_zero(&self.nice, &prev.nice),
            system: sub_or_zero(&self.system, &prev.system),
            idle: sub_or_zero(&self.idle, &prev.idle),
            iowait: sub_or_zero(&self.iowait, &prev.iowait),
            irq: sub_or_zero(&self.irq, &prev.irq),
            softirq: sub_or_zero(&self.softirq, &prev.softirq),
            stolen: sub_or_zero(&self.stolen, &prev.stolen),
        }
    }

    pub fn busy(&self) -> u64 {
        self.user + self.nice + self.system + self.irq + self.softirq + self.stolen
    }

    pub fn total(&self) -> u64 {
        self.busy() + self.idle + self.iowait
    }

    pub fn irq_time(&self) -> u64 {
        self.irq + self.softirq
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuLoad {
    /// Busy share of the interval, 0..100.
    pub load: f64,
    /// Share of the interval spent handling hard and soft interrupts.
    pub irq_load: f64,
    /// False when there was nothing to compare against.
    pub valid: bool,
}

impl CpuLoad {
    pub fn compute(prev: Option<&CpuTimes>, curr: &CpuTimes) -> CpuLoad {
        let prev = match prev {
            Some(prev) => prev,
            None => return CpuLoad::default(),
        };

        let delta = curr.delta(prev);
        let total = delta.total();
        if total == 0 {
            return CpuLoad::default();
        }

        let pct = |v: u64| (v as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
        CpuLoad {
            load: pct(delta.busy()),
            irq_load: pct(delta.irq_time()),
            valid: true,
        }
    }
}

/// Interrupts per second. Zero without a baseline, when the counter went
/// backwards or when no time elapsed.
pub fn irq_rate(prev: Option<u64>, curr: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    match prev {
        Some(prev) if curr >= prev && secs > 0.0 => (curr - prev) as f64 / secs,
        _ => 0.0,
    }
}

/// Raw counters read at one point in time.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub cpu_times: BTreeMap<usize, CpuTimes>,
    pub irq_counts: BTreeMap<usize, u64>,
}

#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub cpus: BTreeMap<usize, CpuLoad>,
    pub irq_rates: BTreeMap<usize, f64>,
}

impl Statistics {
    /// Compare @curr against @prev, taken @interval earlier.
    pub fn compute(prev: Option<&Snapshot>, curr: &Snapshot, interval: Duration) -> Statistics {
        let cpus = curr
            .cpu_times
            .iter()
            .map(|(cpu, times)| {
                let prev_times = prev.and_then(|p| p.cpu_times.get(cpu));
                (*cpu, CpuLoad::compute(prev_times, times))
            })
            .collect();

        let irq_rates = curr
            .irq_counts
            .iter()
            .map(|(irq, count)| {
                let prev_count = prev.and_then(|p| p.irq_counts.get(irq)).copied();
                (*irq, irq_rate(prev_count, *count, interval))
            })
            .collect();

        Statistics { cpus, irq_rates }
    }

    pub fn cpu(&self, cpu: usize) -> CpuLoad {
        self.cpus.get(&cpu).copied().unwrap_or_default()
    }

    pub fn irq_rate(&self, irq: usize) -> f64 {
        self.irq_rates.get(&irq).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(busy: u64, idle: u64, irq: u64) -> CpuTimes {
        CpuTimes {
            user: busy,
            idle,
            irq,
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_load() {
        let prev = times(1000, 1000, 0);
        let curr = times(1850, 1100, 50);
        let load = CpuLoad::compute(Some(&prev), &curr);
        assert!(load.valid);
        assert!((load.load - 90.0).abs() < 1e-9);
        assert!((load.irq_load - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_load_without_baseline() {
        let load = CpuLoad::compute(None, &times(10, 10, 0));
        assert_eq!(load, CpuLoad::default());
        assert!(!load.valid);
    }

    #[test]
    fn test_cpu_load_clock_stopped() {
        let prev = times(500, 500, 0);
        let load = CpuLoad::compute(Some(&prev), &prev);
        assert_eq!(load.load, 0.0);
        assert!(!load.valid);
    }

    #[test]
    fn test_cpu_load_counter_reset() {
        // A reset counter contributes nothing instead of wrapping.
        let prev = times(5000, 100, 0);
        let curr = times(10, 200, 0);
        let load = CpuLoad::compute(Some(&prev), &curr);
        assert!(load.valid);
        assert_eq!(load.load, 0.0);
    }

    #[test]
    fn test_irq_rate() {
        let secs2 = Duration::from_secs(2);
        assert_eq!(irq_rate(Some(100), 160, secs2), 30.0);
        assert_eq!(irq_rate(None, 160, secs2), 0.0);
        assert_eq!(irq_rate(Some(200), 160, secs2), 0.0);
        assert_eq!(irq_rate(Some(100), 160, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_statistics() {
        let mut prev = Snapshot::default();
        prev.cpu_times.insert(0, times(0, 0, 0));
        prev.irq_counts.insert(42, 1000);
        prev.irq_counts.insert(43, 10);

        let mut curr = Snapshot::default();
        curr.cpu_times.insert(0, times(85, 15, 0));
        curr.cpu_times.insert(1, times(10, 90, 0));
        curr.irq_counts.insert(42, 1060);
        curr.irq_counts.insert(44, 500);

        let stats = Statistics::compute(Some(&prev), &curr, Duration::from_secs(2));
        assert!((stats.cpu(0).load - 85.0).abs() < 1e-9);
        assert!(!stats.cpu(1).valid);
        assert_eq!(stats.irq_rate(42), 30.0);
        assert_eq!(stats.irq_rate(44), 0.0);
        assert!(!stats.irq_rates.contains_key(&43));

        let first = Statistics::compute(None, &curr, Duration::from_secs(2));
        assert!(first.cpus.values().all(|c| !c.valid));
        assert!(first.irq_rates.values().all(|r| *r == 0.0));
    }
}
