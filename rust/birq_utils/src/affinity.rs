// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Writes interrupt affinity through `/proc/irq/N/smp_affinity`.
#[derive(Debug, Clone)]
pub struct AffinityWriter {
    proc_root: PathBuf,
}

impl Default for AffinityWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityWriter {
    pub fn new() -> AffinityWriter {
        Self::with_root(Path::new(crate::interrupts::PROCFS_ROOT))
    }

    pub fn with_root(proc_root: &Path) -> AffinityWriter {
        AffinityWriter {
            proc_root: proc_root.to_path_buf(),
        }
    }

    pub fn write(&self, irq: usize, mask: &Cpumask) -> Result<()> {
        if mask.is_empty() {
            bail!("Refusing to write an empty affinity for IRQ {}", irq);
        }

        let path = self.proc_root.join(format!("irq/{}/smp_affinity", irq));
        // The kernel validates the whole mask in a single write.
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        file.write_all(format!("{:x}\n", mask).as_bytes())
            .with_context(|| format!("Failed to write {:x} to {:?}", mask, path))?;

        Ok(())
    }
}

/// Whether the kernel refused the affinity change outright. Some interrupt
/// chips can't be steered at all and answer every write with EIO.
pub fn is_refused(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|e| e.raw_os_error() == Some(libc::EIO))
}
