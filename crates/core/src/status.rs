// SPDX-License-Identifier: MIT

//! The persisted deployment status record (`deployment_status.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted metadata describing the last known deployment.
///
/// Readers tolerate a missing file and materialise a default record with
/// current-time timestamps; see `sentinel_storage::StatusStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub version: String,
    pub deployed_at: DateTime<Utc>,
    pub git_commit: String,
    pub git_branch: String,
    pub last_checked: DateTime<Utc>,
    pub update_available: bool,
}

impl DeploymentStatus {
    /// A freshly materialised default, used when no status file exists yet.
    pub fn default_at(now: DateTime<Utc>) -> Self {
        Self {
            version: "unknown".to_string(),
            deployed_at: now,
            git_commit: "unknown".to_string(),
            git_branch: "unknown".to_string(),
            last_checked: now,
            update_available: false,
        }
    }
}
