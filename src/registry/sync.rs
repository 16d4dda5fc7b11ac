//! Source synchronization: turning a locator into a local tree and a revision.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::PipelineLocator;
use crate::error::SyncError;
use crate::fingerprint::tree_fingerprint;

/// Result of synchronizing one pipeline source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedSource {
    pub local_path: PathBuf,
    /// Opaque revision identifier; any change means new code.
    pub revision: String,
}

/// Brings a pipeline's source tree up to date locally.
#[async_trait]
pub trait SourceSync: Send + Sync {
    async fn sync(&self, locator: &PipelineLocator) -> Result<SyncedSource, SyncError>;
}

/// Synchronizes git repositories with the `git` CLI.
///
/// Missing checkouts are cloned. Existing ones are cleaned, hard-reset and
/// pulled unless `refresh` is off, in which case the checkout is used as is.
#[derive(Debug, Clone)]
pub struct GitSync {
    checkout_dir: PathBuf,
    refresh: bool,
}

impl GitSync {
    pub fn new(checkout_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkout_dir: checkout_dir.into(),
            refresh: true,
        }
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn checkout_path(&self, locator: &PipelineLocator) -> PathBuf {
        self.checkout_dir.join(&locator.name)
    }

    async fn git(&self, locator: &PipelineLocator, cwd: &Path, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(SyncError::CommandFailed {
                locator: locator.raw.clone(),
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceSync for GitSync {
    async fn sync(&self, locator: &PipelineLocator) -> Result<SyncedSource, SyncError> {
        let local_path = self.checkout_path(locator);

        if !local_path.join(".git").exists() {
            tokio::fs::create_dir_all(&self.checkout_dir).await?;
            tracing::info!(pipeline = %locator.name, url = %locator.raw, "Cloning pipeline");
            let target = local_path.to_string_lossy().to_string();
            self.git(locator, &self.checkout_dir, &["clone", &locator.raw, &target])
                .await?;
        } else if self.refresh {
            tracing::debug!(pipeline = %locator.name, "Refreshing pipeline checkout");
            self.git(locator, &local_path, &["clean", "-xdf"]).await?;
            self.git(locator, &local_path, &["reset", "--hard"]).await?;
            self.git(locator, &local_path, &["pull"]).await?;
        }

        let revision = self.git(locator, &local_path, &["rev-parse", "HEAD"]).await?;
        Ok(SyncedSource {
            local_path,
            revision,
        })
    }
}

/// Uses a local directory in place; the revision is a digest of its tree.
#[derive(Debug, Clone, Default)]
pub struct LocalSync;

#[async_trait]
impl SourceSync for LocalSync {
    async fn sync(&self, locator: &PipelineLocator) -> Result<SyncedSource, SyncError> {
        let local_path = PathBuf::from(&locator.raw);
        if !local_path.is_dir() {
            return Err(SyncError::MissingSource(local_path));
        }

        let root = local_path.clone();
        let revision = tokio::task::spawn_blocking(move || tree_fingerprint(&root))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))??;

        Ok(SyncedSource {
            local_path,
            revision: revision.to_string(),
        })
    }
}

/// Dispatches remote locators to git and everything else to the local tree.
#[derive(Debug, Clone)]
pub struct DefaultSync {
    git: GitSync,
    local: LocalSync,
}

impl DefaultSync {
    pub fn new(git: GitSync) -> Self {
        Self { git, local: LocalSync }
    }
}

#[async_trait]
impl SourceSync for DefaultSync {
    async fn sync(&self, locator: &PipelineLocator) -> Result<SyncedSource, SyncError> {
        if locator.is_remote() {
            self.git.sync(locator).await
        } else {
            self.local.sync(locator).await
        }
    }
}
