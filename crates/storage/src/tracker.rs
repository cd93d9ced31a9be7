// SPDX-License-Identifier: MIT

//! Persistence for the last-deployed CI run identifier (`github-artifact-id.txt`).

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactTrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tracks the single opaque run identifier that was last fully deployed.
///
/// Marking deployed is gated strictly on full success elsewhere: this store
/// itself has no opinion on *when* it's written, only on durability once
/// asked to write.
#[derive(Clone)]
pub struct ArtifactTracker {
    path: PathBuf,
}

impl ArtifactTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the stored run id, or empty string if never written
    /// (first-ever deployment).
    pub fn get(&self) -> Result<String, ArtifactTrackerError> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&self.path)?.trim().to_string())
    }

    /// Record `run_id` as the last fully deployed artifact.
    pub fn mark_deployed(&self, run_id: &str) -> Result<(), ArtifactTrackerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path(&self.path);
        fs::write(&tmp_path, run_id)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}
