// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::cpumask::read_cpulist;
use anyhow::bail;
use anyhow::Result;
use std::path::Path;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Read a sysfs cpulist file such as `/sys/devices/system/cpu/online`.
pub fn read_cpulist_file(path: &Path) -> Result<Vec<usize>> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(e) => {
            bail!("Failed to read cpulist {:?}: {}", path, e);
        }
    };

    read_cpulist(&val)
}
