//! Clone-or-update of a single mirrored repository.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, instrument};

use crate::config::RepoConfig;
use crate::git::{bare_repo, commands};

/// Brings the local mirror of one repository up to date with its origin.
#[async_trait]
pub trait MirrorUpdater: Send + Sync {
    async fn update(&self, repo: &RepoConfig, base_path: &Path) -> Result<()>;
}

/// [`MirrorUpdater`] backed by the git binary.
#[derive(Debug, Clone)]
pub struct GitMirrorUpdater {
    git_bin: PathBuf,
}

impl GitMirrorUpdater {
    pub fn new(git_bin: impl Into<PathBuf>) -> Self {
        Self {
            git_bin: git_bin.into(),
        }
    }
}

#[async_trait]
impl MirrorUpdater for GitMirrorUpdater {
    #[instrument(skip(self, base_path), fields(repo = %repo.name))]
    async fn update(&self, repo: &RepoConfig, base_path: &Path) -> Result<()> {
        let dir = base_path.join(&repo.name);

        if bare_repo::is_bare_repo(&dir).await {
            return commands::git_remote_update(&self.git_bin, &dir).await;
        }

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        info!(origin = %repo.origin, dir = %dir.display(), "creating new mirror");
        commands::git_clone_mirror(&self.git_bin, &repo.origin, &dir).await
    }
}
