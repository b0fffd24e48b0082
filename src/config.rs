use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `host:port` for the HTTP listener; the host may be an IP literal or a
    /// hostname.  A bare `:port` binds every interface.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Default refresh interval (seconds) for repos that do not set one.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Directory holding the mirrored bare repositories.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Number of retries after a failed mirror update.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Upper bound on repositories refreshing at the same time.
    #[serde(default = "default_max_concurrent_refreshes", alias = "counter")]
    pub max_concurrent_refreshes: usize,
    #[serde(default)]
    pub smart_http: SmartHttpSettings,
    #[serde(default, alias = "repo")]
    pub repos: Vec<RepoConfig>,
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_interval() -> u64 {
    15 * 60
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_retries() -> u32 {
    3
}

fn default_max_concurrent_refreshes() -> usize {
    4
}

impl Config {
    /// `listen_addr` in a form `TcpListener::bind` accepts.  Hostnames are
    /// left for the resolver at bind time.
    pub fn listen_address(&self) -> Result<String> {
        let addr = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };

        let valid = match addr.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                if host.starts_with('[') {
                    addr.parse::<std::net::SocketAddr>().is_ok()
                } else {
                    !host.is_empty()
                        && host
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
                }
            }
            _ => false,
        };
        if !valid {
            bail!("invalid listen_addr: {}", self.listen_addr);
        }
        Ok(addr)
    }
}

// ---------------------------------------------------------------------------
// Smart HTTP settings
// ---------------------------------------------------------------------------

/// Process-wide settings for the smart HTTP gateway.
///
/// Built once at startup (config file, then CLI overrides) and shared
/// read-only between every request handler.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartHttpSettings {
    /// Serve `git-upload-pack` (fetch).
    #[serde(default = "bool_true")]
    pub upload_pack: bool,
    /// Serve `git-receive-pack` (push).
    #[serde(default = "bool_true")]
    pub receive_pack: bool,
    /// Let `http.uploadpack` / `http.receivepack` in a repository's git config
    /// further restrict a globally enabled service.
    #[serde(default)]
    pub honor_repo_config: bool,
    /// Env var that receives the basic-auth user name of a request.
    #[serde(default)]
    pub auth_user_env_var: String,
    /// Env var that receives the basic-auth password of a request.
    #[serde(default)]
    pub auth_pass_env_var: String,
    /// `KEY=VALUE` pair always injected into the RPC subprocess environment.
    #[serde(default)]
    pub default_env: String,
    #[serde(default = "default_git_bin_path")]
    pub git_bin_path: PathBuf,
    /// Root that request paths are resolved against.  Defaults to `base_path`.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
}

fn bool_true() -> bool {
    true
}

fn default_git_bin_path() -> PathBuf {
    PathBuf::from("/usr/bin/git")
}

impl Default for SmartHttpSettings {
    fn default() -> Self {
        Self {
            upload_pack: true,
            receive_pack: true,
            honor_repo_config: false,
            auth_user_env_var: String::new(),
            auth_pass_env_var: String::new(),
            default_env: String::new(),
            git_bin_path: default_git_bin_path(),
            project_root: None,
        }
    }
}

impl SmartHttpSettings {
    /// The repository root, falling back to the current directory when no
    /// root was configured.
    pub fn root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Unique name, also the path of the mirror below `base_path`.  Derived
    /// from `origin` when omitted.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub origin: String,
    /// Refresh interval in seconds.  Falls back to the global `interval`.
    #[serde(default)]
    pub interval: Option<u64>,
}

impl RepoConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.interval.unwrap_or_else(default_interval))
    }
}

/// Derive a repository name from its origin.
///
/// URLs with a scheme become `host/path`; scp-style remotes such as
/// `git@github.com:owner/repo.git` become `github.com/owner/repo.git`.
pub fn derive_repo_name(origin: &str) -> Option<String> {
    let name = match url::Url::parse(origin) {
        Ok(u) if u.host_str().is_some() => {
            format!("{}{}", u.host_str().unwrap_or_default(), u.path())
        }
        _ => origin
            .rsplit('@')
            .next()
            .unwrap_or_default()
            .replace(':', "/"),
    };

    let name = name.trim_matches('/').to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load, normalise and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse YAML text, fill in defaults and validate.
pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config =
        serde_yaml::from_str(contents).context("failed to parse config")?;
    normalize_config(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Fill derived values: absolute base path, repo names and intervals.
fn normalize_config(config: &mut Config) -> Result<()> {
    config.base_path = std::path::absolute(&config.base_path).with_context(|| {
        format!(
            "unable to get absolute path to base path: {}",
            config.base_path.display()
        )
    })?;

    if config.smart_http.project_root.is_none() {
        config.smart_http.project_root = Some(config.base_path.clone());
    }

    let default_interval = config.interval;
    for (i, repo) in config.repos.iter_mut().enumerate() {
        if repo.origin.is_empty() {
            bail!("origin required for repo {}", i + 1);
        }
        if repo.name.is_empty() {
            repo.name = derive_repo_name(&repo.origin).with_context(|| {
                format!(
                    "could not generate name for origin {}, please set a name",
                    repo.origin
                )
            })?;
        }
        if repo.interval.unwrap_or(0) == 0 {
            repo.interval = Some(default_interval);
        }
    }
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.repos.is_empty(),
        "no repos found in config, please define repos under `repos`"
    );
    anyhow::ensure!(
        config.max_concurrent_refreshes > 0,
        "max_concurrent_refreshes must be at least 1"
    );
    anyhow::ensure!(config.interval > 0, "interval must be greater than zero");
    config.listen_address()?;

    let mut seen = HashSet::new();
    for repo in &config.repos {
        anyhow::ensure!(
            seen.insert(repo.name.as_str()),
            "multiple repos with name {}",
            repo.name
        );
        anyhow::ensure!(
            !Path::new(&repo.name)
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir)),
            "repo name {} must be a relative path without `..`",
            repo.name
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
