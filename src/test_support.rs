//! Shared helpers for unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_SCRIPT: AtomicUsize = AtomicUsize::new(0);

/// Write an executable `/bin/sh` script standing in for the git binary and
/// return its path.  Each call gets a fresh file name.
pub fn fake_git(dir: &Path, body: &str) -> PathBuf {
    let n = NEXT_SCRIPT.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("fake-git-{n}"));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
