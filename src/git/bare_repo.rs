//! Locating bare repositories on the local filesystem.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};

/// Check whether `path` looks like a bare Git repository.
///
/// A bare repo is a directory containing a `HEAD` file.  This is a
/// lightweight heuristic, not an integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn is_bare_repo(path: &Path) -> bool {
    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a bare repo");
    }
    head_exists
}

/// Resolve the repository path segment of a request against `root`.
///
/// Returns `None` when the segment tries to leave `root` (`..` or an absolute
/// path) or when the resulting directory does not exist.  Callers answer both
/// cases with the same 404.
pub async fn resolve_repo_dir(root: &Path, segment: &str) -> Option<PathBuf> {
    let relative = Path::new(segment);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        debug!(%segment, "rejected repository path outside the root");
        return None;
    }

    let dir = root.join(relative);
    match tokio::fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => Some(dir),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
