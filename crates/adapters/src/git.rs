// SPDX-License-Identifier: MIT

//! Source-control working copy management.

use sentinel_core::ChangeCategories;
use sentinel_exec::{CommandRunner, ExecError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: ExecError,
    },
    #[error("pull failed: {0}")]
    Pull(#[source] ExecError),
    #[error("command failed: {0}")]
    Command(#[from] ExecError),
}

const FETCH_BACKOFF: Duration = Duration::from_secs(2);

/// Drives the `git` CLI against a single working copy.
#[derive(Clone)]
pub struct GitChecker {
    repo_dir: PathBuf,
    remote: String,
    runner: CommandRunner,
}

impl GitChecker {
    pub fn new(repo_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
            runner: CommandRunner::new(),
        }
    }

    fn git(&self) -> &CommandRunner {
        &self.runner
    }

    /// Mark the working copy as globally trusted to git. Idempotent;
    /// failure is logged and swallowed (non-fatal).
    pub async fn ensure_safe_directory(&self) {
        let path = self.repo_dir.to_string_lossy().to_string();
        let result = self
            .git()
            .run(
                "git",
                &["config", "--global", "--add", "safe.directory", &path],
                None,
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to mark working copy as a safe directory");
        }
    }

    /// Shallow-fetch the configured remote, retrying with a fixed 2s
    /// backoff up to `max_retries` times.
    pub async fn fetch_updates(&self, max_retries: u32) -> Result<(), GitError> {
        self.git()
            .run_with_retry(
                "git",
                &["fetch", "--depth", "1", &self.remote],
                Some(&self.repo_dir),
                max_retries,
                FETCH_BACKOFF,
            )
            .await
            .map(|_| ())
            .map_err(|source| GitError::Fetch {
                attempts: max_retries + 1,
                source,
            })
    }

    /// Compare `HEAD` to `origin/<branch>`, returning both commit hashes
    /// unconditionally alongside whether they differ.
    pub async fn has_changes(&self, branch: &str) -> Result<(bool, String, String), GitError> {
        let local = self.rev_parse("HEAD").await?;
        let remote = self.rev_parse(&format!("origin/{branch}")).await?;
        Ok((local != remote, local, remote))
    }

    async fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let out = self
            .git()
            .run("git", &["rev-parse", rev], Some(&self.repo_dir))
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// List files changed between two commits: trimmed, non-empty, with
    /// paths normalised to forward slashes.
    pub async fn get_changed_files(
        &self,
        local: &str,
        remote: &str,
    ) -> Result<Vec<String>, GitError> {
        let out = self
            .git()
            .run(
                "git",
                &["diff", "--name-only", local, remote],
                Some(&self.repo_dir),
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().replace('\\', "/"))
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Classify each path against the closed vocabulary, replaying an
    /// ordered rule list. Multiple categories may be set for one file;
    /// application order is irrelevant since every rule only sets flags.
    pub fn categorize_changes(&self, files: &[String]) -> ChangeCategories {
        let mut categories = ChangeCategories::new();
        for path in files {
            categorize_one(path, &mut categories);
        }
        categories
    }

    /// Reset to `HEAD`, clean untracked files, ensure a shallow clone, fetch
    /// and reset to `origin/<branch>`, then prune unreachable objects.
    pub async fn pull_changes(&self, branch: &str) -> Result<(), GitError> {
        self.git()
            .run("git", &["reset", "--hard", "HEAD"], Some(&self.repo_dir))
            .await
            .map_err(GitError::Pull)?;
        self.git()
            .run("git", &["clean", "-fd"], Some(&self.repo_dir))
            .await
            .map_err(GitError::Pull)?;

        if !self.is_shallow().await {
            self.convert_to_shallow(branch).await?;
        }

        self.git()
            .run(
                "git",
                &["fetch", "--depth", "1", "origin", branch],
                Some(&self.repo_dir),
            )
            .await
            .map_err(GitError::Pull)?;
        self.git()
            .run(
                "git",
                &["reset", "--hard", &format!("origin/{branch}")],
                Some(&self.repo_dir),
            )
            .await
            .map_err(GitError::Pull)?;
        self.git()
            .run("git", &["gc", "--prune=now"], Some(&self.repo_dir))
            .await
            .map_err(GitError::Pull)?;

        Ok(())
    }

    /// `git rev-parse --abbrev-ref HEAD`.
    pub async fn get_current_branch(&self) -> Result<String, GitError> {
        let out = self
            .git()
            .run(
                "git",
                &["rev-parse", "--abbrev-ref", "HEAD"],
                Some(&self.repo_dir),
            )
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// True if `.git/shallow` exists.
    pub async fn is_shallow(&self) -> bool {
        self.repo_dir.join(".git").join("shallow").exists()
    }

    /// Convert a full clone to depth-1 by re-initialising the working copy
    /// in place: snapshot the remote + current commit, wipe `.git`,
    /// re-init, re-add the remote, fetch at depth 1, reset. Warns if the
    /// resulting commit differs from the one captured before the convert
    /// (the remote moved underneath us).
    pub async fn convert_to_shallow(&self, branch: &str) -> Result<(), GitError> {
        let remote_url = self
            .git()
            .run(
                "git",
                &["remote", "get-url", &self.remote],
                Some(&self.repo_dir),
            )
            .await?
            .stdout
            .trim()
            .to_string();
        let captured_commit = self.rev_parse("HEAD").await.unwrap_or_default();

        let git_dir = self.repo_dir.join(".git");
        if git_dir.exists() {
            std::fs::remove_dir_all(&git_dir)
                .map_err(|e| ExecError::SpawnFailed("rm -rf .git".to_string(), e))?;
        }

        self.git()
            .run("git", &["init"], Some(&self.repo_dir))
            .await?;
        self.git()
            .run(
                "git",
                &["remote", "add", &self.remote, &remote_url],
                Some(&self.repo_dir),
            )
            .await?;
        self.git()
            .run(
                "git",
                &["fetch", "--depth", "1", &self.remote, branch],
                Some(&self.repo_dir),
            )
            .await?;
        self.git()
            .run(
                "git",
                &["reset", "--hard", &format!("{}/{branch}", self.remote)],
                Some(&self.repo_dir),
            )
            .await?;

        let new_commit = self.rev_parse("HEAD").await.unwrap_or_default();
        if !captured_commit.is_empty() && captured_commit != new_commit {
            warn!(
                captured_commit,
                new_commit, "remote moved during shallow conversion"
            );
        }
        info!("converted working copy to a shallow clone");
        Ok(())
    }
}

fn categorize_one(path: &str, categories: &mut ChangeCategories) {
    if path == "trader/go.mod" || path == "trader/go.sum" {
        categories.main_binary = true;
    } else if path.starts_with("trader/")
        && !path.starts_with("trader/static/")
        && !path.starts_with("trader/frontend/")
    {
        categories.main_binary = true;
    }

    if path.starts_with("trader/frontend/") {
        categories.frontend = true;
    }

    if path.starts_with("display/app/") {
        categories.display_app = true;
    }

    if path.contains("arduino-app/sketch/") || path.contains("display/sketch/") {
        categories.firmware = true;
    }

    if let Some(rest) = path.strip_prefix("microservices/") {
        if let Some((name, tail)) = rest.split_once('/') {
            if tail.starts_with("app/") {
                categories.microservice_code.insert(name.to_string());
            }
            if tail == "requirements.txt" {
                categories.microservice_deps.insert(name.to_string());
            }
        }
    }

    if path.starts_with("config/") || path == ".env" || path.ends_with(".env") {
        categories.config = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categorize(paths: &[&str]) -> ChangeCategories {
        let checker = GitChecker::new("/tmp/unused", "origin");
        let files: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
        checker.categorize_changes(&files)
    }

    #[test]
    fn empty_file_list_yields_zero_categories() {
        assert!(!categorize(&[]).has_any_changes());
    }

    #[yare::parameterized(
        main_go_file = { "trader/main.go", true, false, false, false, false },
        go_mod = { "trader/go.mod", true, false, false, false, false },
        go_sum = { "trader/go.sum", true, false, false, false, false },
        static_under_trader = { "trader/static/index.html", false, false, false, false, false },
        frontend_under_trader = { "trader/frontend/src/App.tsx", false, true, false, false, false },
        display_app = { "display/app/main.go", false, false, true, false, false },
        arduino_sketch = { "arduino-app/sketch/sketch.ino", false, false, false, true, false },
        display_sketch = { "display/sketch/sketch.ino", false, false, false, true, false },
        config_dir = { "config/prod.toml", false, false, false, false, true },
        dotenv = { ".env", false, false, false, false, true },
        dot_env_suffix = { "deploy/prod.env", false, false, false, false, true },
        unrelated_path = { "README.md", false, false, false, false, false },
    )]
    fn categorize_single_path(
        path: &str,
        main_binary: bool,
        frontend: bool,
        display_app: bool,
        firmware: bool,
        config: bool,
    ) {
        let c = categorize(&[path]);
        assert_eq!(c.main_binary, main_binary, "main_binary for {path}");
        assert_eq!(c.frontend, frontend, "frontend for {path}");
        assert_eq!(c.display_app, display_app, "display_app for {path}");
        assert_eq!(c.firmware, firmware, "firmware for {path}");
        assert_eq!(c.config, config, "config for {path}");
    }

    #[test]
    fn static_path_never_sets_main_binary() {
        let c = categorize(&["trader/static/app.js", "trader/static/nested/deep.css"]);
        assert!(!c.main_binary);
    }

    #[test]
    fn trader_path_not_under_static_or_frontend_always_sets_main_binary() {
        let c = categorize(&["trader/internal/engine.go"]);
        assert!(c.main_binary);
    }

    #[test]
    fn microservice_app_sets_code_category_for_named_service() {
        let c = categorize(&["microservices/pypfopt/app/main.py"]);
        assert_eq!(
            c.microservice_code,
            std::collections::BTreeSet::from(["pypfopt".to_string()])
        );
        assert!(c.microservice_deps.is_empty());
    }

    #[test]
    fn microservice_requirements_sets_deps_category() {
        let c = categorize(&["microservices/pypfopt/requirements.txt"]);
        assert!(c.microservice_code.is_empty());
        assert_eq!(
            c.microservice_deps,
            std::collections::BTreeSet::from(["pypfopt".to_string()])
        );
    }

    #[test]
    fn single_file_can_set_multiple_categories() {
        // Not realistic in practice, but the rules are independent so
        // nothing prevents it: a config file that also happens to live
        // under trader/ sets both.
        let c = categorize(&["trader/config/settings.env"]);
        assert!(c.main_binary);
        assert!(c.config);
    }

    #[test]
    fn categorization_is_order_independent() {
        let paths = vec![
            "trader/main.go".to_string(),
            "trader/frontend/App.tsx".to_string(),
            "microservices/pypfopt/app/x.py".to_string(),
            "config/a.toml".to_string(),
        ];
        let mut reversed = paths.clone();
        reversed.reverse();

        let checker = GitChecker::new("/tmp/unused", "origin");
        assert_eq!(
            checker.categorize_changes(&paths),
            checker.categorize_changes(&reversed)
        );
    }

    const SAMPLE_PATHS: &[&str] = &[
        "trader/main.go",
        "trader/go.mod",
        "trader/static/index.html",
        "trader/frontend/App.tsx",
        "display/app/main.go",
        "arduino-app/sketch/sketch.ino",
        "microservices/pypfopt/app/x.py",
        "microservices/pypfopt/requirements.txt",
        "microservices/risk/requirements.txt",
        "config/prod.toml",
        ".env",
        "README.md",
    ];

    proptest::proptest! {
        #[test]
        fn categorize_changes_is_order_independent_proptest(
            indices in proptest::collection::vec(0..SAMPLE_PATHS.len(), 0..16)
        ) {
            let mut paths: Vec<String> = indices
                .iter()
                .map(|&i| SAMPLE_PATHS[i].to_string())
                .collect();
            let checker = GitChecker::new("/tmp/unused", "origin");
            let forward = checker.categorize_changes(&paths);
            paths.reverse();
            let backward = checker.categorize_changes(&paths);
            proptest::prop_assert_eq!(forward, backward);
        }
    }
}
