// SPDX-License-Identifier: MIT

use sentinel_adapters::{
    ArtifactClient, BinaryDeployer, ContainerManager, FirmwareDeployer, GitChecker, Lock,
    LockError, ServiceManager, StaticDeployer,
};
use sentinel_core::{
    ChangeCategories, Clock, DeploymentResult, GoServiceConfig, OrchestratorConfig,
    ServiceDeployment, ServiceKind,
};
use sentinel_storage::{ArtifactTracker, StatusStore};
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Everything a single native-service deployment needs, held by value so it
/// can be moved into its own spawned task — native services are deployed in
/// parallel, one task each.
#[derive(Clone)]
struct NativeDeployContext {
    artifact_client: Option<ArtifactClient>,
    artifact_tracker: ArtifactTracker,
    services: ServiceManager,
    binary: BinaryDeployer,
    deploy_dir: std::path::PathBuf,
    health_check_max_attempts: u32,
    health_check_timeout: std::time::Duration,
}

impl NativeDeployContext {
    /// Prepare a scratch dir, download the artifact, stop, atomic-replace,
    /// start (with one best-effort retry), probe health for the primary
    /// service only, and mark the artifact deployed strictly on full success.
    /// The scratch dir is reclaimed on every exit path, success or failure.
    async fn deploy(self, config: GoServiceConfig, run_id: Option<String>, scratch: std::path::PathBuf) -> ServiceDeployment {
        let result = self.deploy_inner(&config, run_id, &scratch).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(scratch = %scratch.display(), error = %e, "failed to clean up scratch directory");
            }
        }

        result
    }

    async fn deploy_inner(
        &self,
        config: &GoServiceConfig,
        run_id: Option<String>,
        scratch: &std::path::Path,
    ) -> ServiceDeployment {
        let Some(client) = &self.artifact_client else {
            return ServiceDeployment::failed(
                config.service_name.clone(),
                ServiceKind::Native,
                "no artifact source configured",
            );
        };

        let previous_run_id = self.artifact_tracker.get().unwrap_or_default();
        let (resolved_run_id, binary_path) = match client
            .deploy_latest(scratch, run_id.as_deref(), &previous_run_id)
            .await
        {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                return ServiceDeployment::failed(
                    config.service_name.clone(),
                    ServiceKind::Native,
                    "no new artifact available",
                )
            }
            Err(e) => return ServiceDeployment::failed(config.service_name.clone(), ServiceKind::Native, e),
        };

        if let Err(e) = self.services.stop(&config.service_name).await {
            return ServiceDeployment::failed(config.service_name.clone(), ServiceKind::Native, e);
        }

        if let Err(e) = self
            .binary
            .deploy(&binary_path, &self.deploy_dir, &config.binary_name, true)
            .await
        {
            return ServiceDeployment::failed(config.service_name.clone(), ServiceKind::Native, e);
        }

        if let Err(original) = self.services.start(&config.service_name).await {
            warn!(service = %config.service_name, error = %original, "start failed, retrying once");
            if let Err(_retry_err) = self.services.start(&config.service_name).await {
                return ServiceDeployment::failed(config.service_name.clone(), ServiceKind::Native, original);
            }
        }

        let mut health_ok = true;
        if config.is_primary {
            if let Some(url) = &config.health_url {
                if let Err(e) = self
                    .services
                    .check_health(url, self.health_check_max_attempts, self.health_check_timeout)
                    .await
                {
                    warn!(service = %config.service_name, error = %e, "health check failed");
                    health_ok = false;
                }
            }
        }

        // MarkDeployed only fires once the binary is both running and
        // (for the primary service) healthy.
        if health_ok {
            if let Err(e) = self.artifact_tracker.mark_deployed(&resolved_run_id) {
                warn!(error = %e, "failed to persist artifact tracker record");
            }
        }

        ServiceDeployment::ok(config.service_name.clone(), ServiceKind::Native)
    }
}

/// Orchestrates every adapter behind the `Deploy`/`HardUpdate` workflows.
/// Owns the lifetime of all sub-components and all scratch paths;
/// sub-components own their configured external resources only for the
/// duration of a single operation.
pub struct Manager<'a> {
    config: OrchestratorConfig,
    clock: &'a dyn Clock,
    lock: Lock<'a>,
    git: GitChecker,
    artifact_client: Option<ArtifactClient>,
    artifact_tracker: ArtifactTracker,
    status_store: StatusStore<'a>,
    binary: BinaryDeployer,
    services: ServiceManager,
    containers: ContainerManager,
    static_deployer: StaticDeployer,
    firmware: Option<FirmwareDeployer>,
}

impl<'a> Manager<'a> {
    pub fn new(config: OrchestratorConfig, clock: &'a dyn Clock) -> Self {
        let lock_path = config.lock_path();
        let tracker_path = config.artifact_tracker_path();
        let status_path = config.status_path();
        let git = GitChecker::new(config.repo_dir.clone(), config.remote.clone());
        let artifact_client = config.artifact.clone().map(ArtifactClient::new);
        let firmware = config.firmware_board_fqbn.clone().map(FirmwareDeployer::new);

        Self {
            lock: Lock::new(lock_path, clock),
            git,
            artifact_client,
            artifact_tracker: ArtifactTracker::new(tracker_path),
            status_store: StatusStore::new(status_path, clock),
            binary: BinaryDeployer::new(),
            services: ServiceManager::new(),
            containers: ContainerManager::new().with_binary(config.container_binary.clone()),
            static_deployer: StaticDeployer::new(),
            firmware,
            config,
            clock,
        }
    }

    /// Incremental, change-driven deployment.
    #[instrument(skip(self), fields(repo = %self.config.repo_dir.display()))]
    pub async fn deploy(&self) -> DeploymentResult {
        self.run(false).await
    }

    /// Unconditional variant: skips change detection, always pulls, always
    /// attempts every service and every auxiliary deployer, always rebuilds
    /// container images. Firmware failures are already non-fatal in
    /// `Deploy`, so there is nothing further to relax for them here.
    #[instrument(skip(self), fields(repo = %self.config.repo_dir.display()))]
    pub async fn hard_update(&self) -> DeploymentResult {
        self.run(true).await
    }

    async fn run(&self, hard: bool) -> DeploymentResult {
        let start = Instant::now();
        self.git.ensure_safe_directory().await;

        let owner_id = Uuid::new_v4().to_string();
        let guard = match self.lock.acquire(self.config.lock_timeout, &owner_id) {
            Ok(guard) => guard,
            Err(LockError::AlreadyLocked) => {
                warn!("another deployment is already in progress");
                return failure_result("AlreadyLocked", start);
            }
            Err(e) => {
                warn!(error = %e, "failed to acquire lock");
                return failure_result(e, start);
            }
        };

        let result = self.deploy_locked(hard, start).await;
        drop(guard);
        result
    }

    async fn deploy_locked(&self, hard: bool, start: Instant) -> DeploymentResult {
        let branch = self.resolve_branch().await;

        if let Err(e) = self.git.fetch_updates(self.config.max_fetch_retries).await {
            warn!(error = %e, "fetch failed");
            return failure_result(e, start);
        }

        let (changed, local_commit, remote_commit) = match self.git.has_changes(&branch).await {
            Ok(v) => v,
            Err(e) => return failure_result(e, start),
        };

        let previous_run_id = self.artifact_tracker.get().unwrap_or_default();
        let mut new_run_id: Option<String> = None;
        if let Some(client) = &self.artifact_client {
            match client.check_for_new_build(&previous_run_id).await {
                Ok(id) if !id.is_empty() => new_run_id = Some(id),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to check for new build"),
            }
        }

        if !hard && !changed && new_run_id.is_none() {
            info!("nothing to do");
            return DeploymentResult::no_op(start.elapsed());
        }

        let mut categories = ChangeCategories::new();
        if changed || hard {
            match self.git.get_changed_files(&local_commit, &remote_commit).await {
                Ok(files) => categories = self.git.categorize_changes(&files),
                Err(e) => warn!(error = %e, "failed to list changed files"),
            }
            if let Err(e) = self.git.pull_changes(&branch).await {
                return DeploymentResult {
                    success: false,
                    commit_before: Some(local_commit),
                    error_message: Some(e.to_string()),
                    duration: start.elapsed(),
                    ..Default::default()
                };
            }
        }

        if new_run_id.is_some() || hard {
            categories.main_binary = true;
        }

        if !hard && !categories.has_any_changes() {
            return DeploymentResult {
                success: true,
                deployed: false,
                commit_before: Some(local_commit),
                commit_after: Some(remote_commit),
                duration: start.elapsed(),
                ..Default::default()
            };
        }

        let mut services = self.deploy_services(&categories, new_run_id.as_deref(), hard).await;
        let firmware_deployed = self.deploy_auxiliary(&categories, &remote_commit, hard, &mut services).await;

        self.persist_status_if_needed(&services, firmware_deployed, &remote_commit, &branch);

        DeploymentResult {
            commit_before: Some(local_commit),
            commit_after: Some(remote_commit),
            services,
            firmware_deployed,
            duration: start.elapsed(),
            ..Default::default()
        }
        .finalize()
    }

    /// Frontend, display app, and firmware: all non-fatal.
    async fn deploy_auxiliary(
        &self,
        categories: &ChangeCategories,
        content_key: &str,
        hard: bool,
        services: &mut Vec<ServiceDeployment>,
    ) -> bool {
        if categories.frontend || hard {
            if let (Some(source), Some(target)) =
                (&self.config.frontend_source, &self.config.frontend_target)
            {
                match self.static_deployer.deploy(source, target, content_key).await {
                    Ok(_) => services.push(ServiceDeployment::ok("frontend", ServiceKind::Assets)),
                    Err(e) => {
                        warn!(error = %e, "frontend deploy failed");
                        services.push(ServiceDeployment::failed("frontend", ServiceKind::Assets, e));
                    }
                }
            }
        }

        if categories.display_app || hard {
            if let (Some(source), Some(target)) =
                (&self.config.display_app_source, &self.config.display_app_target)
            {
                match self.static_deployer.deploy(source, target, content_key).await {
                    Ok(_) => services.push(ServiceDeployment::ok("display_app", ServiceKind::Assets)),
                    Err(e) => {
                        warn!(error = %e, "display app deploy failed");
                        services.push(ServiceDeployment::failed("display_app", ServiceKind::Assets, e));
                    }
                }
            }
        }

        let mut firmware_deployed = false;
        if categories.firmware || hard {
            if let (Some(sketch), Some(firmware)) = (&self.config.firmware_sketch, &self.firmware) {
                let platform = self
                    .config
                    .firmware_platform
                    .clone()
                    .unwrap_or_else(|| "arduino:avr".to_string());
                match firmware.deploy(sketch, &platform).await {
                    Ok(_) => {
                        firmware_deployed = true;
                        services.push(ServiceDeployment::ok("firmware", ServiceKind::Firmware));
                    }
                    Err(e) => {
                        warn!(error = %e, "firmware deploy failed, ignoring");
                        services.push(ServiceDeployment::failed("firmware", ServiceKind::Firmware, e));
                    }
                }
            }
        }
        firmware_deployed
    }

    /// Persist a new status record iff at least one service succeeded or a
    /// non-service category (firmware) was deployed.
    fn persist_status_if_needed(
        &self,
        services: &[ServiceDeployment],
        firmware_deployed: bool,
        commit: &str,
        branch: &str,
    ) {
        let any_service_success = services.iter().any(|s| s.success);
        if !any_service_success && !firmware_deployed {
            return;
        }

        let Ok(mut status) = self.status_store.read() else {
            return;
        };
        status.git_commit = commit.to_string();
        status.git_branch = branch.to_string();
        status.last_checked = self.clock.now();
        status.deployed_at = self.clock.now();
        status.update_available = false;
        if let Err(e) = self.status_store.write(&status) {
            warn!(error = %e, "failed to persist deployment status");
        }
    }

    async fn resolve_branch(&self) -> String {
        if let Some(branch) = &self.config.branch {
            return branch.clone();
        }
        match self.git.get_current_branch().await {
            Ok(branch) if !branch.is_empty() && branch != "HEAD" => branch,
            _ => "main".to_string(),
        }
    }

    fn native_context(&self) -> NativeDeployContext {
        NativeDeployContext {
            artifact_client: self.artifact_client.clone(),
            artifact_tracker: self.artifact_tracker.clone(),
            services: self.services.clone(),
            binary: self.binary,
            deploy_dir: self.config.deploy_dir.clone(),
            health_check_max_attempts: self.config.health_check_max_attempts,
            health_check_timeout: self.config.health_check_timeout,
        }
    }

    /// Launch native service deployments in parallel, then deploy container
    /// microservices sequentially — they share scarce resources.
    async fn deploy_services(
        &self,
        categories: &ChangeCategories,
        run_id: Option<&str>,
        hard: bool,
    ) -> Vec<ServiceDeployment> {
        let mut results = Vec::new();

        if categories.main_binary || hard {
            let mut handles = Vec::with_capacity(self.config.go_services.len());
            for service in &self.config.go_services {
                let ctx = self.native_context();
                let service = service.clone();
                let run_id = run_id.map(str::to_string);
                let scratch = self.config.scratch_dir(&service.name);
                handles.push(tokio::spawn(ctx.deploy(service, run_id, scratch)));
            }
            for handle in handles {
                match handle.await {
                    Ok(deployment) => results.push(deployment),
                    Err(e) => warn!(error = %e, "native service deployment task panicked"),
                }
            }
        }

        for name in categories.touched_microservices() {
            let Some(ms) = self.config.microservices.iter().find(|m| m.name == name) else {
                continue;
            };
            let rebuild_required = hard || categories.microservice_deps.contains(&name);

            let rebuild_and_restart = async {
                if rebuild_required {
                    self.containers
                        .rebuild_image(&name, &ms.compose_dir)
                        .await?;
                }
                self.containers.restart_container(&name, &ms.compose_dir).await
            };

            match rebuild_and_restart.await {
                Ok(()) => {
                    if let Err(e) = self
                        .containers
                        .health_check(
                            &name,
                            &ms.compose_dir,
                            ms.health_url.as_deref(),
                            self.config.health_check_max_attempts,
                            self.config.health_check_timeout,
                        )
                        .await
                    {
                        warn!(service = %name, error = %e, "microservice health check failed, non-fatal");
                    }
                    results.push(ServiceDeployment::ok(name.clone(), ServiceKind::Container));
                }
                Err(e) => results.push(ServiceDeployment::failed(name.clone(), ServiceKind::Container, e)),
            }
        }

        results
    }
}

fn failure_result(error: impl ToString, start: Instant) -> DeploymentResult {
    DeploymentResult {
        success: false,
        error_message: Some(error.to_string()),
        duration: start.elapsed(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::FakeClock;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn base_config(deploy_dir: &std::path::Path, repo_dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig {
            deploy_dir: deploy_dir.to_path_buf(),
            repo_dir: repo_dir.to_path_buf(),
            branch: None,
            remote: "origin".to_string(),
            lock_timeout: StdDuration::from_secs(60),
            max_fetch_retries: 1,
            go_services: Vec::new(),
            microservices: Vec::new(),
            artifact: None,
            frontend_source: None,
            frontend_target: None,
            display_app_source: None,
            display_app_target: None,
            firmware_sketch: None,
            firmware_board_fqbn: None,
            firmware_platform: None,
            container_binary: "docker".to_string(),
            health_check_max_attempts: 1,
            health_check_timeout: StdDuration::from_secs(1),
        }
    }

    #[test]
    fn failure_result_carries_the_error_message() {
        let start = Instant::now();
        let result = failure_result("boom", start);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn resolve_branch_prefers_configured_value_over_git() {
        let deploy_dir = tempdir().unwrap();
        let repo_dir = tempdir().unwrap();
        let mut config = base_config(deploy_dir.path(), repo_dir.path());
        config.branch = Some("release".to_string());
        let clock = FakeClock::new(chrono::Utc::now());
        let manager = Manager::new(config, &clock);
        assert_eq!(manager.resolve_branch().await, "release");
    }

    #[tokio::test]
    async fn deploy_auxiliary_copies_frontend_when_category_set() {
        let deploy_dir = tempdir().unwrap();
        let repo_dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        std::fs::write(source.path().join("index.html"), b"<html></html>").unwrap();
        let target = tempdir().unwrap();

        let mut config = base_config(deploy_dir.path(), repo_dir.path());
        config.frontend_source = Some(source.path().to_path_buf());
        config.frontend_target = Some(target.path().to_path_buf());

        let clock = FakeClock::new(chrono::Utc::now());
        let manager = Manager::new(config, &clock);

        let mut categories = ChangeCategories::new();
        categories.frontend = true;
        let mut services = Vec::new();
        let firmware_deployed = manager
            .deploy_auxiliary(&categories, "abc123", false, &mut services)
            .await;

        assert!(!firmware_deployed);
        assert_eq!(services.len(), 1);
        assert!(services[0].success);
        assert_eq!(services[0].service_name, "frontend");
    }

    #[tokio::test]
    async fn deploy_auxiliary_skips_frontend_when_category_unset() {
        let deploy_dir = tempdir().unwrap();
        let repo_dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        let mut config = base_config(deploy_dir.path(), repo_dir.path());
        config.frontend_source = Some(source.path().to_path_buf());
        config.frontend_target = Some(deploy_dir.path().to_path_buf());

        let clock = FakeClock::new(chrono::Utc::now());
        let manager = Manager::new(config, &clock);

        let categories = ChangeCategories::new();
        let mut services = Vec::new();
        manager
            .deploy_auxiliary(&categories, "abc123", false, &mut services)
            .await;
        assert!(services.is_empty());
    }
}
