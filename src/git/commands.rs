//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the configured `git` binary.  Commands that
//! talk to an origin run with `GIT_TERMINAL_PROMPT=0` so a missing credential
//! fails fast instead of blocking on a prompt.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Ref advertisement
// ---------------------------------------------------------------------------

/// Run `git <service> --stateless-rpc --advertise-refs .` inside `repo_path`
/// and return the advertisement bytes.
///
/// The subprocess inherits the server environment; `protocol` (the client's
/// `Git-Protocol` header) is passed through as `GIT_PROTOCOL`.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_advertise_refs(
    git_bin: &Path,
    repo_path: &Path,
    service: &str,
    protocol: Option<&str>,
) -> Result<Vec<u8>> {
    let mut cmd = Command::new(git_bin);
    cmd.arg(service)
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(".")
        .current_dir(repo_path);

    if let Some(version) = protocol {
        cmd.env("GIT_PROTOCOL", version);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {service} --advertise-refs"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {service} --advertise-refs failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!(bytes = output.stdout.len(), "ref advertisement generated");
    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Server info
// ---------------------------------------------------------------------------

/// Run `git update-server-info` so the dumb-protocol files (`info/refs`,
/// `objects/info/packs`) reflect the current repository state.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_update_server_info(git_bin: &Path, repo_path: &Path) -> Result<()> {
    let output = Command::new(git_bin)
        .arg("update-server-info")
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git update-server-info")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git update-server-info failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Read a single git config value for the repository at `repo_path`.
///
/// Returns `None` when the key is unset or git fails; a missing setting and a
/// broken repository are treated alike by the access checks.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_config_get(git_bin: &Path, repo_path: &Path, key: &str) -> Option<String> {
    let output = Command::new(git_bin)
        .arg("config")
        .arg("--get")
        .arg(key)
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!value.is_empty()).then_some(value)
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "failed to spawn git config");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Mirror clone / update
// ---------------------------------------------------------------------------

/// Run `git clone --mirror <origin> <dest>`.
#[instrument(fields(%origin, dest = %dest.display()))]
pub async fn git_clone_mirror(git_bin: &Path, origin: &str, dest: &Path) -> Result<()> {
    let output = Command::new(git_bin)
        .arg("clone")
        .arg("--mirror")
        .arg(origin)
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git clone --mirror")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone --mirror failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone --mirror succeeded");
    Ok(())
}

/// Run `git remote update --prune` inside an existing mirror.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_remote_update(git_bin: &Path, repo_path: &Path) -> Result<()> {
    let output = Command::new(git_bin)
        .arg("remote")
        .arg("update")
        .arg("--prune")
        .current_dir(repo_path)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git remote update")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git remote update failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git remote update succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
