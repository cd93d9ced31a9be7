// SPDX-License-Identifier: MIT

//! Remote CI artifact discovery and download.

use sentinel_core::ArtifactClientConfig;
use sentinel_exec::CommandRunner;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const API_VERSION_HEADER: &str = "X-CI-Api-Version";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("missing authentication token: environment variable {0} is not set")]
    MissingToken(String),
    #[error("request to {url} failed with status {status}: {body_preview}")]
    Http {
        url: String,
        status: u16,
        body_preview: String,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("workflow `{0}` was not found")]
    WorkflowNotFound(String),
    #[error("no artifact named `{0}` found for run {1}")]
    ArtifactNotFound(String, String),
    #[error("no binary found inside extracted artifact")]
    BinaryNotFound,
    #[error("zip entry `{0}` escapes the extraction directory")]
    PathEscape(String),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("downloaded binary is {found_os}/{found_arch}, expected {expected_os}/{expected_arch}")]
    Mismatch {
        expected_os: String,
        expected_arch: String,
        found_os: String,
        found_arch: String,
    },
}

/// Identifies one CI run. Only `run_id` is persisted by the caller (see
/// `sentinel-storage::ArtifactTracker`).
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub run_id: String,
    pub head_commit: String,
    pub created_at: String,
}

fn deserialize_id_as_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdShape {
        Number(i64),
        Text(String),
    }
    match IdShape::deserialize(d)? {
        IdShape::Number(n) => Ok(n.to_string()),
        IdShape::Text(s) => Ok(s),
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowsResponse {
    workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    #[serde(deserialize_with = "deserialize_id_as_string")]
    id: String,
    name: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct Run {
    #[serde(deserialize_with = "deserialize_id_as_string")]
    id: String,
    head_sha: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    artifacts: Vec<ArtifactEntry>,
}

#[derive(Debug, Deserialize)]
struct ArtifactEntry {
    #[serde(deserialize_with = "deserialize_id_as_string")]
    id: String,
    name: String,
}

/// Target platform a downloaded binary must match.
#[derive(Debug, Clone, Copy)]
pub struct TargetPlatform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl TargetPlatform {
    /// The platform this orchestrator process is itself running on.
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

/// HTTPS client for a remote CI service.
#[derive(Clone)]
pub struct ArtifactClient {
    config: ArtifactClientConfig,
    http: reqwest::Client,
    exec: CommandRunner,
    target: TargetPlatform,
}

impl ArtifactClient {
    pub fn new(config: ArtifactClientConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            exec: CommandRunner::new(),
            target: TargetPlatform::current(),
        }
    }

    fn token(&self) -> Result<String, ArtifactError> {
        std::env::var(&self.config.token_env_var)
            .map_err(|_| ArtifactError::MissingToken(self.config.token_env_var.clone()))
    }

    fn authed(&self, url: &str) -> Result<reqwest::RequestBuilder, ArtifactError> {
        Ok(self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .header(API_VERSION_HEADER, API_VERSION))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, ArtifactError> {
        let response = self.authed(url)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(500).collect();
            return Err(ArtifactError::Http {
                url: url.to_string(),
                status: status.as_u16(),
                body_preview: preview,
            });
        }
        Ok(response.json().await?)
    }

    /// Resolve the configured workflow name to its numeric identifier,
    /// matching by name, path, or path suffix.
    async fn resolve_workflow_id(&self) -> Result<String, ArtifactError> {
        let url = format!(
            "{}/repos/{}/{}/actions/workflows",
            self.config.api_base, self.config.owner, self.config.repo
        );
        let workflows: WorkflowsResponse = self.get_json(&url).await?;
        workflows
            .workflows
            .into_iter()
            .find(|w| {
                w.name == self.config.workflow_name
                    || w.path == self.config.workflow_name
                    || w.path.ends_with(&self.config.workflow_name)
            })
            .map(|w| w.id)
            .ok_or_else(|| ArtifactError::WorkflowNotFound(self.config.workflow_name.clone()))
    }

    async fn latest_successful_run(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ArtifactDescriptor>, ArtifactError> {
        let url = format!(
            "{}/repos/{}/{}/actions/workflows/{}/runs?branch={}&status=success&per_page=1",
            self.config.api_base, self.config.owner, self.config.repo, workflow_id, self.config.branch
        );
        let runs: RunsResponse = self.get_json(&url).await?;
        Ok(runs.workflow_runs.into_iter().next().map(|r| ArtifactDescriptor {
            run_id: r.id,
            head_commit: r.head_sha,
            created_at: r.created_at,
        }))
    }

    /// Returns the new run id if it differs from `previous_run_id` (or if
    /// `previous_run_id` is empty), empty string otherwise.
    pub async fn check_for_new_build(
        &self,
        previous_run_id: &str,
    ) -> Result<String, ArtifactError> {
        let workflow_id = self.resolve_workflow_id().await?;
        let latest = self.latest_successful_run(&workflow_id).await?;
        match latest {
            Some(descriptor) if descriptor.run_id != previous_run_id => {
                info!(run_id = %descriptor.run_id, "new build available");
                Ok(descriptor.run_id)
            }
            _ => Ok(String::new()),
        }
    }

    /// Download, extract, and verify the artifact for `run_id`, returning
    /// the path to the verified binary inside `output_dir`.
    pub async fn download_artifact(
        &self,
        run_id: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        let artifact_id = self.find_artifact_id(run_id).await?;
        let zip_bytes = self.download_zip(&artifact_id).await?;

        let extract_dir = output_dir.join(format!("extract-{run_id}"));
        tokio::fs::create_dir_all(&extract_dir).await?;
        extract_zip(&zip_bytes, &extract_dir)?;

        let binary_path = locate_binary(&extract_dir, &self.config.artifact_name)?;
        self.verify_platform(&binary_path).await?;
        Ok(binary_path)
    }

    async fn find_artifact_id(&self, run_id: &str) -> Result<String, ArtifactError> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{}/artifacts",
            self.config.api_base, self.config.owner, self.config.repo, run_id
        );
        let artifacts: ArtifactsResponse = self.get_json(&url).await?;
        artifacts
            .artifacts
            .into_iter()
            .find(|a| a.name == self.config.artifact_name)
            .map(|a| a.id)
            .ok_or_else(|| {
                ArtifactError::ArtifactNotFound(self.config.artifact_name.clone(), run_id.to_string())
            })
    }

    async fn download_zip(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactError> {
        let url = format!(
            "{}/repos/{}/{}/actions/artifacts/{}/zip",
            self.config.api_base, self.config.owner, self.config.repo, artifact_id
        );
        let response = self.authed(&url)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArtifactError::Http {
                url,
                status: status.as_u16(),
                body_preview: body.chars().take(500).collect(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Verify the binary targets both the expected OS and architecture by
    /// inspecting it with the external `file` tool. Deletes the binary and
    /// fails on any mismatch.
    async fn verify_platform(&self, binary_path: &Path) -> Result<(), ArtifactError> {
        let output = self
            .exec
            .run("file", &["-b", &binary_path.to_string_lossy()], None)
            .await
            .map_err(|e| ArtifactError::Http {
                url: "file(1)".to_string(),
                status: 0,
                body_preview: e.to_string(),
            })?;
        let description = output.stdout.to_lowercase();

        let os_ok = match self.target.os {
            "linux" => description.contains("linux") || description.contains("elf"),
            "macos" => description.contains("mach-o"),
            "windows" => description.contains("pe32") || description.contains("executable"),
            _ => true,
        };
        let arch_ok = match self.target.arch {
            "x86_64" => description.contains("x86-64") || description.contains("x86_64"),
            "aarch64" => {
                description.contains("aarch64")
                    || description.contains("arm64")
                    || description.contains("arm aarch64")
            }
            _ => true,
        };

        if os_ok && arch_ok {
            return Ok(());
        }

        warn!(path = %binary_path.display(), description, "artifact failed machine-type check");
        let _ = tokio::fs::remove_file(binary_path).await;
        Err(ArtifactError::Mismatch {
            expected_os: self.target.os.to_string(),
            expected_arch: self.target.arch.to_string(),
            found_os: description.clone(),
            found_arch: description,
        })
    }

    /// If `run_id` is empty, discover the latest new build first; if still
    /// none, return `Ok(None)` ("no new build").
    pub async fn deploy_latest(
        &self,
        output_dir: &Path,
        run_id: Option<&str>,
        previous_run_id: &str,
    ) -> Result<Option<(String, PathBuf)>, ArtifactError> {
        let run_id = match run_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.check_for_new_build(previous_run_id).await?,
        };
        if run_id.is_empty() {
            return Ok(None);
        }
        let path = self.download_artifact(&run_id, output_dir).await?;
        Ok(Some((run_id, path)))
    }
}

/// Known machine-suffix tokens used to spot a binary by filename when the
/// artifact name itself doesn't match.
const MACHINE_SUFFIXES: &[&str] = &["x86_64", "aarch64", "amd64", "arm64"];

fn locate_binary(extract_dir: &Path, artifact_name: &str) -> Result<PathBuf, ArtifactError> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(extract_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if file_name == artifact_name {
            return Ok(path);
        }
        candidates.push((file_name, path));
    }

    candidates
        .into_iter()
        .find(|(name, _)| {
            name.contains(artifact_name) || MACHINE_SUFFIXES.iter().any(|s| name.ends_with(s))
        })
        .map(|(_, path)| path)
        .ok_or(ArtifactError::BinaryNotFound)
}

/// Extract a ZIP archive into `dest`, rejecting any member whose cleaned
/// target path would escape `dest` (zip-slip protection).
fn extract_zip(zip_bytes: &[u8], dest: &Path) -> Result<(), ArtifactError> {
    let reader = std::io::Cursor::new(zip_bytes);
    let mut archive = zip::ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(ArtifactError::PathEscape(entry.name().to_string()));
        };
        let target = dest.join(&enclosed);
        if !target.starts_with(dest) {
            return Err(ArtifactError::PathEscape(entry.name().to_string()));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out_file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}
