// SPDX-License-Identifier: MIT

//! Declarative configuration records for the orchestrator.
//!
//! These are plain data; loading them from a file or CLI flags is left to
//! the embedding binary (`sentinel-daemon`), not this crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One native Go service the Manager knows how to build and deploy.
///
/// Immutable per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoServiceConfig {
    pub name: String,
    pub build_path: String,
    pub binary_name: String,
    pub service_name: String,
    /// Only the primary service is health-probed after a native deploy.
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub health_url: Option<String>,
}

/// A container-deployed microservice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroserviceConfig {
    pub name: String,
    pub compose_dir: PathBuf,
    #[serde(default)]
    pub health_url: Option<String>,
}

/// Configuration for the remote CI artifact service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactClientConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub workflow_name: String,
    pub artifact_name: String,
    pub branch: String,
    /// Name of the environment variable holding the bearer token.
    pub token_env_var: String,
}

/// Top-level configuration for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub deploy_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub branch: Option<String>,
    pub remote: String,
    #[serde(with = "duration_secs")]
    pub lock_timeout: Duration,
    pub max_fetch_retries: u32,
    pub go_services: Vec<GoServiceConfig>,
    pub microservices: Vec<MicroserviceConfig>,
    pub artifact: Option<ArtifactClientConfig>,
    pub frontend_source: Option<PathBuf>,
    pub frontend_target: Option<PathBuf>,
    pub display_app_source: Option<PathBuf>,
    pub display_app_target: Option<PathBuf>,
    pub firmware_sketch: Option<PathBuf>,
    pub firmware_board_fqbn: Option<String>,
    pub firmware_platform: Option<String>,
    #[serde(default = "default_container_binary")]
    pub container_binary: String,
    #[serde(default = "default_health_check_max_attempts")]
    pub health_check_max_attempts: u32,
    #[serde(default = "default_health_check_timeout", with = "duration_secs")]
    pub health_check_timeout: Duration,
}

fn default_container_binary() -> String {
    "docker".to_string()
}

fn default_health_check_max_attempts() -> u32 {
    5
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(5)
}

impl OrchestratorConfig {
    pub fn lock_path(&self) -> PathBuf {
        self.deploy_dir.join(".deploy.lock")
    }

    pub fn scratch_dir(&self, service: &str) -> PathBuf {
        self.deploy_dir.join(".tmp").join(service)
    }

    pub fn artifact_tracker_path(&self) -> PathBuf {
        self.deploy_dir.join("github-artifact-id.txt")
    }

    pub fn status_path(&self) -> PathBuf {
        self.deploy_dir.join("deployment_status.json")
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
