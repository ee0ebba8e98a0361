// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::warn;

/// Holds the PID file for as long as it lives. Refuses to start over an
/// existing file so that two instances never fight over the same IRQs.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<PidFile> {
        let mut f = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to create PID file {:?}", path))?;
        writeln!(f, "{}", std::process::id())
            .with_context(|| format!("Failed to write PID file {:?}", path))?;

        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pidfile() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("birq.pid");

        let pidfile = PidFile::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(pidfile.path()).unwrap(),
            format!("{}\n", std::process::id())
        );
        assert!(PidFile::create(&path).is_err());

        drop(pidfile);
        assert!(!path.exists());
    }
}
