// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Configuration
//!
//! The balancing policy lives in a TOML file, `/etc/birq.conf` by default:
//!
//!```toml
//!     threshold = 90.0
//!     load-limit = 80.0
//!     strategy = "max"
//!     short-interval = 2
//!     long-interval = 5
//!     exclude-cpus = "3"
//!     use-cpus = "ff"
//!     ht = false
//!     non-local-cpus = false
//!     pinned-irqs = [0, 9]
//!     place-new-irqs = true
//!```
//!
//! Omitted keys take their defaults every time the file is read, so removing
//! a key and reloading restores the default. Command line overrides are
//! applied on top of every load.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use birq_utils::Cpumask;
use serde::Deserialize;

use crate::balance::BalanceParams;
use crate::balance::Strategy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/birq.conf";

pub const DEFAULT_THRESHOLD: f64 = 99.0;
pub const DEFAULT_LOAD_LIMIT: f64 = 95.0;
pub const DEFAULT_SHORT_INTERVAL: u64 = 2;
pub const DEFAULT_LONG_INTERVAL: u64 = 5;
/// Longest accepted interval, one day.
pub const MAX_INTERVAL: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// CPUs busier than this percentage are overloaded.
    pub threshold: f64,
    /// Destinations must stay under this percentage.
    pub load_limit: f64,
    pub strategy: Strategy,
    /// Seconds between cycles while IRQs are being moved.
    pub short_interval: u64,
    /// Seconds between cycles otherwise.
    pub long_interval: u64,
    pub exclude_cpus: Option<String>,
    pub use_cpus: Option<String>,
    /// Whether hyperthread siblings are destinations too.
    pub ht: bool,
    pub non_local_cpus: bool,
    pub pinned_irqs: Vec<usize>,
    pub place_new_irqs: bool,

    #[serde(skip)]
    exclude_mask: Cpumask,
    #[serde(skip)]
    use_mask: Option<Cpumask>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            load_limit: DEFAULT_LOAD_LIMIT,
            strategy: Strategy::Rnd,
            short_interval: DEFAULT_SHORT_INTERVAL,
            long_interval: DEFAULT_LONG_INTERVAL,
            exclude_cpus: None,
            use_cpus: None,
            ht: true,
            non_local_cpus: false,
            pinned_irqs: vec![],
            place_new_irqs: true,
            exclude_mask: Cpumask::new(),
            use_mask: None,
        }
    }
}

fn parse_mask(key: &str, val: &str) -> Result<Cpumask> {
    Cpumask::from_str(val).with_context(|| format!("Invalid {} {:?}", key, val))
}

fn check_interval(key: &str, val: u64) -> Result<()> {
    if !(1..=MAX_INTERVAL).contains(&val) {
        bail!("{} must be within 1 and {} seconds, got {}", key, MAX_INTERVAL, val);
    }
    Ok(())
}

fn check_pct(key: &str, val: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&val) {
        bail!("{} must be within 0 and 100, got {}", key, val);
    }
    Ok(())
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(content)?;
        config.parse_masks()?;
        Ok(config)
    }

    fn parse_masks(&mut self) -> Result<()> {
        self.exclude_mask = match &self.exclude_cpus {
            Some(val) => parse_mask("exclude-cpus", val)?,
            None => Cpumask::new(),
        };
        self.use_mask = match &self.use_cpus {
            Some(val) => Some(parse_mask("use-cpus", val)?),
            None => None,
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_pct("threshold", self.threshold)?;
        check_pct("load-limit", self.load_limit)?;
        check_interval("short-interval", self.short_interval)?;
        check_interval("long-interval", self.long_interval)
    }

    /// CPUs never used as destinations or sources: `exclude-cpus | ~use-cpus`
    /// over the first @nr_cpu_ids CPUs.
    pub fn exclusion_mask(&self, nr_cpu_ids: usize) -> Cpumask {
        match &self.use_mask {
            Some(use_mask) => self.exclude_mask.or(&use_mask.not_within(nr_cpu_ids)),
            None => self.exclude_mask.clone(),
        }
    }

    pub fn is_pinned(&self, irq: usize) -> bool {
        self.pinned_irqs.contains(&irq)
    }

    pub fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_interval)
    }

    pub fn long_interval(&self) -> Duration {
        Duration::from_secs(self.long_interval)
    }

    pub fn balance_params(&self) -> BalanceParams {
        BalanceParams {
            threshold: self.threshold,
            load_limit: self.load_limit,
            non_local_cpus: self.non_local_cpus,
            ht: self.ht,
            place_new_irqs: self.place_new_irqs,
        }
    }
}

/// Command line values which take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub threshold: Option<f64>,
    pub load_limit: Option<f64>,
    pub short_interval: Option<u64>,
    pub long_interval: Option<u64>,
    pub strategy: Option<Strategy>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(v) = self.threshold {
            config.threshold = v;
        }
        if let Some(v) = self.load_limit {
            config.load_limit = v;
        }
        if let Some(v) = self.short_interval {
            config.short_interval = v;
        }
        if let Some(v) = self.long_interval {
            config.long_interval = v;
        }
        if let Some(v) = self.strategy {
            config.strategy = v;
        }
    }
}

/// Produces candidate configurations. Nothing is swapped in here, the caller
/// decides what to do with a candidate or an error.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
    user_defined: bool,
    overrides: ConfigOverrides,
}

impl ConfigLoader {
    /// @user_defined tells whether @path was given explicitly, in which case
    /// it must exist.
    pub fn new(path: &Path, user_defined: bool, overrides: ConfigOverrides) -> Self {
        Self {
            path: path.to_path_buf(),
            user_defined,
            overrides,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, override and validate the file. Ok(None) when the default file
    /// doesn't exist.
    pub fn load(&self) -> Result<Option<Config>> {
        if !self.path.exists() {
            if self.user_defined {
                bail!("Can't find config file {:?}", self.path);
            }
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file {:?}", self.path))?;
        let mut config = Config::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", self.path))?;
        self.finish(&mut config)?;
        Ok(Some(config))
    }

    /// Configuration to start with: the file if present, defaults otherwise.
    pub fn initial(&self) -> Result<Config> {
        match self.load()? {
            Some(config) => Ok(config),
            None => {
                let mut config = Config::default();
                self.finish(&mut config)?;
                Ok(config)
            }
        }
    }

    fn finish(&self, config: &mut Config) -> Result<()> {
        self.overrides.apply(config);
        config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.threshold, 99.0);
        assert_eq!(config.load_limit, 95.0);
        assert_eq!(config.strategy, Strategy::Rnd);
        assert_eq!(config.short_interval(), Duration::from_secs(2));
        assert_eq!(config.long_interval(), Duration::from_secs(5));
        assert!(config.ht);
        assert!(!config.non_local_cpus);
        assert!(config.place_new_irqs);
        assert!(config.exclusion_mask(8).is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse() {
        let config = Config::from_toml_str(
            r#"
threshold = 70.5
load-limit = 50
strategy = "max"
short-interval = 1
long-interval = 10
exclude-cpus = "1"
ht = false
non-local-cpus = true
pinned-irqs = [0, 9]
place-new-irqs = false
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.threshold, 70.5);
        assert_eq!(config.strategy, Strategy::Max);
        assert_eq!(config.long_interval(), Duration::from_secs(10));
        assert!(!config.ht);
        assert!(config.non_local_cpus);
        assert!(config.is_pinned(9));
        assert!(!config.is_pinned(10));
        assert_eq!(config.exclusion_mask(4), Cpumask::from_cpulist("0").unwrap());

        let params = config.balance_params();
        assert_eq!(params.load_limit, 50.0);
        assert!(!params.place_new_irqs);
    }

    #[test]
    fn test_exclusion_mask() {
        let config = Config::from_toml_str("exclude-cpus = \"1\"\nuse-cpus = \"0000000f\"\n").unwrap();
        assert_eq!(config.exclusion_mask(8), Cpumask::from_cpulist("0,4-7").unwrap());

        let config = Config::from_toml_str("use-cpus = \"00000000,00000003\"\n").unwrap();
        assert_eq!(config.exclusion_mask(4), Cpumask::from_cpulist("2-3").unwrap());
    }

    #[test]
    fn test_invalid() {
        assert!(Config::from_toml_str("strategy = \"random\"").is_err());
        assert!(Config::from_toml_str("exclude-cpus = \"xyz\"").is_err());
        assert!(Config::from_toml_str("no-such-key = 1").is_err());

        let config = Config::from_toml_str("threshold = 101.0").unwrap();
        assert!(config.validate().is_err());
        let config = Config::from_toml_str("load-limit = -1.0").unwrap();
        assert!(config.validate().is_err());
        let config = Config::from_toml_str("short-interval = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_bound() {
        let config = Config::from_toml_str("long-interval = 86400").unwrap();
        config.validate().unwrap();

        let config = Config::from_toml_str("long-interval = 86401").unwrap();
        assert!(config.validate().is_err());
        let config = Config::from_toml_str("long-interval = 9223372036854775807").unwrap();
        assert!(config.validate().is_err());

        // Command line values go through the same check.
        let mut config = Config::default();
        ConfigOverrides {
            short_interval: Some(u64::MAX),
            ..Default::default()
        }
        .apply(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loader() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("birq.conf");
        let overrides = ConfigOverrides {
            threshold: Some(80.0),
            ..Default::default()
        };

        // Missing default file falls back to the defaults.
        let loader = ConfigLoader::new(&path, false, overrides.clone());
        assert!(loader.load().unwrap().is_none());
        let config = loader.initial().unwrap();
        assert_eq!(config.threshold, 80.0);
        assert_eq!(config.load_limit, DEFAULT_LOAD_LIMIT);

        // Missing explicit file is an error.
        let loader = ConfigLoader::new(&path, true, overrides.clone());
        assert!(loader.load().is_err());

        fs::write(&path, "threshold = 70.0\nload-limit = 60.0\n").unwrap();
        let config = loader.load().unwrap().unwrap();
        assert_eq!(config.threshold, 80.0);
        assert_eq!(config.load_limit, 60.0);

        fs::write(&path, "threshold = 170.0\n").unwrap();
        let loader = ConfigLoader::new(&path, true, ConfigOverrides::default());
        assert!(loader.load().is_err());
    }
}
