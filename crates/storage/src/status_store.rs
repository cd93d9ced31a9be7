// SPDX-License-Identifier: MIT

//! Persistence for [`DeploymentStatus`] (`deployment_status.json`).

use sentinel_core::{Clock, DeploymentStatus};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and writes the deployment status file.
///
/// Readers tolerate a missing file and materialise a default record instead
/// of erroring. A file that fails to parse is quarantined to `.bak` rather
/// than wiping the orchestrator's only history.
pub struct StatusStore<'a> {
    path: PathBuf,
    clock: &'a dyn Clock,
}

impl<'a> StatusStore<'a> {
    pub fn new(path: impl Into<PathBuf>, clock: &'a dyn Clock) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    /// Read the current status, or a fresh default if the file is absent.
    pub fn read(&self) -> Result<DeploymentStatus, StatusStoreError> {
        if !self.path.exists() {
            return Ok(DeploymentStatus::default_at(self.clock.now()));
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        match serde_json::from_reader(reader) {
            Ok(status) => Ok(status),
            Err(e) => {
                let bak_path = self.path.with_extension("bak");
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    bak = %bak_path.display(),
                    "corrupt deployment status, quarantining and starting fresh"
                );
                fs::rename(&self.path, &bak_path)?;
                Ok(DeploymentStatus::default_at(self.clock.now()))
            }
        }
    }

    /// Write a new status atomically (write-to-temp, then rename).
    pub fn write(&self, status: &DeploymentStatus) -> Result<(), StatusStoreError> {
        write_atomic(&self.path, status)
    }
}

fn write_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StatusStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::FakeClock;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_default_record() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(chrono::Utc::now());
        let store = StatusStore::new(dir.path().join("status.json"), &clock);
        let status = store.read().unwrap();
        assert_eq!(status.git_commit, "unknown");
        assert!(!status.update_available);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(chrono::Utc::now());
        let store = StatusStore::new(dir.path().join("status.json"), &clock);

        let mut status = store.read().unwrap();
        status.git_commit = "abc123".to_string();
        status.git_branch = "main".to_string();
        status.version = "1.2.3".to_string();
        store.write(&status).unwrap();

        let reread = store.read().unwrap();
        assert_eq!(reread.git_commit, "abc123");
        assert_eq!(reread.git_branch, "main");
        assert_eq!(reread.version, "1.2.3");
    }

    #[test]
    fn corrupt_file_is_quarantined_and_default_returned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        fs::write(&path, b"not json").unwrap();

        let clock = FakeClock::new(chrono::Utc::now());
        let store = StatusStore::new(&path, &clock);
        let status = store.read().unwrap();
        assert_eq!(status.git_commit, "unknown");
        assert!(path.with_extension("bak").exists());
        assert!(!path.exists());
    }
}
