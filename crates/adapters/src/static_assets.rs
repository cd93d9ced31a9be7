// SPDX-License-Identifier: MIT

//! Recursive copy of a static asset tree into a content-addressed target
//! directory.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StaticDeployError {
    #[error("source directory {0} does not exist")]
    SourceMissing(PathBuf),
    #[error("IO error copying {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copies a static asset tree, preserving file modes. Not atomic: assets are
/// idempotent content and the target is a fresh, content-addressed
/// subdirectory, so a half-finished copy is simply overwritten by the next
/// attempt rather than swapped in at the end.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDeployer;

impl StaticDeployer {
    pub fn new() -> Self {
        Self
    }

    /// Copy everything under `source` into `target/<content_key>`, returning
    /// the final directory.
    pub async fn deploy(
        &self,
        source: &Path,
        target: &Path,
        content_key: &str,
    ) -> Result<PathBuf, StaticDeployError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(StaticDeployError::SourceMissing(source.to_path_buf()));
        }
        let dest_root = target.join(content_key);
        info!(source = %source.display(), dest = %dest_root.display(), "copying static assets");
        copy_dir_recursive(source, &dest_root).await?;
        Ok(dest_root)
    }
}

fn copy_dir_recursive<'a>(
    source: &'a Path,
    dest: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StaticDeployError>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|source_err| io_err(dest, source_err))?;

        let mut entries = tokio::fs::read_dir(source)
            .await
            .map_err(|source_err| io_err(source, source_err))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source_err| io_err(source, source_err))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|source_err| io_err(&entry.path(), source_err))?;
            let dest_path = dest.join(entry.file_name());

            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dest_path).await?;
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &dest_path)
                    .await
                    .map_err(|source_err| io_err(&entry.path(), source_err))?;
                preserve_mode(&entry.path(), &dest_path).await?;
            }
        }
        Ok(())
    })
}

fn io_err(path: &Path, source: std::io::Error) -> StaticDeployError {
    StaticDeployError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
async fn preserve_mode(source: &Path, dest: &Path) -> Result<(), StaticDeployError> {
    let perms = tokio::fs::metadata(source)
        .await
        .map_err(|e| io_err(source, e))?
        .permissions();
    tokio::fs::set_permissions(dest, perms)
        .await
        .map_err(|e| io_err(dest, e))
}

#[cfg(not(unix))]
async fn preserve_mode(_source: &Path, _dest: &Path) -> Result<(), StaticDeployError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn copies_nested_tree_preserving_contents() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("frontend");
        tokio::fs::create_dir_all(source.join("assets")).await.unwrap();
        tokio::fs::write(source.join("index.html"), b"<html></html>").await.unwrap();
        tokio::fs::write(source.join("assets/app.js"), b"console.log(1)").await.unwrap();

        let target = dir.path().join("www");
        let deployer = StaticDeployer::new();
        let dest = deployer.deploy(&source, &target, "abc123").await.unwrap();

        assert_eq!(dest, target.join("abc123"));
        assert_eq!(
            tokio::fs::read(dest.join("index.html")).await.unwrap(),
            b"<html></html>"
        );
        assert_eq!(
            tokio::fs::read(dest.join("assets/app.js")).await.unwrap(),
            b"console.log(1)"
        );
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = tempdir().unwrap();
        let deployer = StaticDeployer::new();
        let err = deployer
            .deploy(&dir.path().join("nope"), &dir.path().join("www"), "key")
            .await
            .unwrap_err();
        assert!(matches!(err, StaticDeployError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn redeploying_same_key_overwrites_idempotently() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("frontend");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("index.html"), b"v1").await.unwrap();

        let target = dir.path().join("www");
        let deployer = StaticDeployer::new();
        deployer.deploy(&source, &target, "same-key").await.unwrap();

        tokio::fs::write(source.join("index.html"), b"v2").await.unwrap();
        let dest = deployer.deploy(&source, &target, "same-key").await.unwrap();

        assert_eq!(tokio::fs::read(dest.join("index.html")).await.unwrap(), b"v2");
    }
}
