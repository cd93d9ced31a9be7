// SPDX-License-Identifier: MIT

//! `sentineld` embedding glue: resolve an [`OrchestratorConfig`] from the
//! process environment. Loading configuration from a file or CLI flags is
//! out of scope; this is the minimum needed to exercise `sentinel-engine`
//! from a real process.

use sentinel_core::{ArtifactClientConfig, GoServiceConfig, MicroserviceConfig, OrchestratorConfig};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is required but not set")]
    MissingVar(&'static str),
    #[error("environment variable {0} could not be parsed: {1}")]
    InvalidVar(&'static str, String),
    #[error("{0} is not valid JSON: {1}")]
    InvalidJson(&'static str, serde_json::Error),
}

/// Build-time git commit, baked in via `env!` at compile time with a
/// fallback when the build script did not set it.
pub fn build_git_hash() -> &'static str {
    option_env!("SENTINEL_BUILD_GIT_HASH").unwrap_or("unknown")
}

/// Resolve an [`OrchestratorConfig`] entirely from environment variables.
///
/// `SENTINEL_GO_SERVICES` and `SENTINEL_MICROSERVICES`, when set, are JSON
/// arrays deserialising directly to `Vec<GoServiceConfig>` /
/// `Vec<MicroserviceConfig>`; omitted they default to empty, which is a
/// valid (if useless) orchestrator run.
pub fn config_from_env() -> Result<OrchestratorConfig, ConfigError> {
    let deploy_dir = required_path("SENTINEL_DEPLOY_DIR")?;
    let repo_dir = required_path("SENTINEL_REPO_DIR")?;

    let go_services = json_var_or_default::<Vec<GoServiceConfig>>("SENTINEL_GO_SERVICES")?;
    let microservices = json_var_or_default::<Vec<MicroserviceConfig>>("SENTINEL_MICROSERVICES")?;
    let artifact = optional_artifact_config()?;

    Ok(OrchestratorConfig {
        deploy_dir,
        repo_dir,
        branch: optional_var("SENTINEL_BRANCH"),
        remote: optional_var("SENTINEL_REMOTE").unwrap_or_else(|| "origin".to_string()),
        lock_timeout: duration_secs_var("SENTINEL_LOCK_TIMEOUT_SECS", 300)?,
        max_fetch_retries: u32_var("SENTINEL_MAX_FETCH_RETRIES", 3)?,
        go_services,
        microservices,
        artifact,
        frontend_source: optional_path("SENTINEL_FRONTEND_SOURCE"),
        frontend_target: optional_path("SENTINEL_FRONTEND_TARGET"),
        display_app_source: optional_path("SENTINEL_DISPLAY_APP_SOURCE"),
        display_app_target: optional_path("SENTINEL_DISPLAY_APP_TARGET"),
        firmware_sketch: optional_path("SENTINEL_FIRMWARE_SKETCH"),
        firmware_board_fqbn: optional_var("SENTINEL_FIRMWARE_BOARD_FQBN"),
        firmware_platform: optional_var("SENTINEL_FIRMWARE_PLATFORM"),
        container_binary: optional_var("SENTINEL_CONTAINER_BINARY").unwrap_or_else(|| "docker".to_string()),
        health_check_max_attempts: u32_var("SENTINEL_HEALTH_CHECK_MAX_ATTEMPTS", 5)?,
        health_check_timeout: duration_secs_var("SENTINEL_HEALTH_CHECK_TIMEOUT_SECS", 5)?,
    })
}

fn optional_artifact_config() -> Result<Option<ArtifactClientConfig>, ConfigError> {
    let Some(api_base) = optional_var("SENTINEL_CI_API_BASE") else {
        return Ok(None);
    };
    Ok(Some(ArtifactClientConfig {
        api_base,
        owner: required_var("SENTINEL_CI_OWNER")?,
        repo: required_var("SENTINEL_CI_REPO")?,
        workflow_name: required_var("SENTINEL_CI_WORKFLOW_NAME")?,
        artifact_name: required_var("SENTINEL_CI_ARTIFACT_NAME")?,
        branch: optional_var("SENTINEL_CI_BRANCH").unwrap_or_else(|| "main".to_string()),
        token_env_var: optional_var("SENTINEL_CI_TOKEN_ENV").unwrap_or_else(|| "SENTINEL_CI_TOKEN".to_string()),
    }))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    optional_var(name).ok_or(ConfigError::MissingVar(name))
}

fn optional_path(name: &str) -> Option<PathBuf> {
    optional_var(name).map(PathBuf::from)
}

fn required_path(name: &'static str) -> Result<PathBuf, ConfigError> {
    required_var(name).map(PathBuf::from)
}

fn u32_var(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar(name, raw)),
        None => Ok(default),
    }
}

fn duration_secs_var(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match optional_var(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidVar(name, raw)),
        None => Ok(Duration::from_secs(default_secs)),
    }
}

fn json_var_or_default<T: serde::de::DeserializeOwned + Default>(
    name: &'static str,
) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidJson(name, e)),
        None => Ok(T::default()),
    }
}
