mod config;
mod git;
mod health;
mod http;
mod metrics;
mod mirror;
#[cfg(all(test, unix))]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, SmartHttpSettings};
use crate::http::routes::RouteTable;
use crate::metrics::MetricsRegistry;
use crate::mirror::budget::ConcurrencyBudget;
use crate::mirror::scheduler::Scheduler;
use crate::mirror::updater::GitMirrorUpdater;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "git-mirror", about = "Mirror git repositories and serve them over HTTP")]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,

    /// Env var that receives the basic-auth password of RPC requests.
    #[arg(long, alias = "auth_pass_env_var")]
    auth_pass_env_var: Option<String>,

    /// Env var that receives the basic-auth user of RPC requests.
    #[arg(long, alias = "auth_user_env_var")]
    auth_user_env_var: Option<String>,

    /// `KEY=VALUE` injected into every RPC subprocess.
    #[arg(long, alias = "default_env")]
    default_env: Option<String>,

    /// Directory that request paths are resolved against.
    #[arg(long, alias = "project_root")]
    project_root: Option<PathBuf>,

    #[arg(long, alias = "git_bin_path")]
    git_bin_path: Option<PathBuf>,

    /// Refuse fetches (`git-upload-pack`).
    #[arg(long, alias = "disable_upload_pack")]
    disable_upload_pack: bool,

    /// Refuse pushes (`git-receive-pack`).
    #[arg(long, alias = "disable_receive_pack")]
    disable_receive_pack: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the configured settings.
    fn apply_overrides(&self, settings: &mut SmartHttpSettings) {
        if let Some(v) = &self.auth_pass_env_var {
            settings.auth_pass_env_var = v.clone();
        }
        if let Some(v) = &self.auth_user_env_var {
            settings.auth_user_env_var = v.clone();
        }
        if let Some(v) = &self.default_env {
            settings.default_env = v.clone();
        }
        if let Some(v) = &self.project_root {
            settings.project_root = Some(v.clone());
        }
        if let Some(v) = &self.git_bin_path {
            settings.git_bin_path = v.clone();
        }
        if self.disable_upload_pack {
            settings.upload_pack = false;
        }
        if self.disable_receive_pack {
            settings.receive_pack = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<SmartHttpSettings>,
    pub routes: Arc<RouteTable>,
    pub metrics: MetricsRegistry,
    /// Refresh tokens shared by every mirror loop.
    pub budget: ConcurrencyBudget,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn bind_listener(config: &Config) -> Result<tokio::net::TcpListener> {
    let listen_addr = config.listen_address()?;
    let listener = tokio::net::TcpListener::bind(listen_addr.as_str())
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%listen_addr, %local_addr, "HTTP server listening");
    Ok(listener)
}

async fn run_http_server(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = http::handler::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let mut settings = config.smart_http.clone();
    cli.apply_overrides(&mut settings);

    tracing::info!(
        config_path = %cli.config.display(),
        base_path = %config.base_path.display(),
        repos = config.repos.len(),
        "starting git-mirror"
    );

    // ---- Ensure base path exists ----
    tokio::fs::create_dir_all(&config.base_path)
        .await
        .with_context(|| format!("failed to create {}", config.base_path.display()))?;

    // ---- App state ----
    let routes = RouteTable::new();
    tracing::debug!(routes = routes.routes().len(), "route table compiled");

    let state = Arc::new(AppState {
        budget: ConcurrencyBudget::new(config.max_concurrent_refreshes),
        config: Arc::new(config),
        settings: Arc::new(settings),
        routes: Arc::new(routes),
        metrics: MetricsRegistry::new(),
    });

    let listener = bind_listener(&state.config).await?;
    let shutdown = CancellationToken::new();

    // ---- Mirror refresh loops ----
    let scheduler = Scheduler::new(
        Arc::new(GitMirrorUpdater::new(state.settings.git_bin_path.clone())),
        state.budget.clone(),
        state.config.base_path.clone(),
        state.config.retries,
        Arc::clone(&state.metrics.metrics),
    );
    let refresh_handles = scheduler.spawn_all(&state.config.repos, &shutdown);

    // ---- HTTP server ----
    let http_handle = tokio::spawn({
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        async move {
            let result = run_http_server(listener, state, shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %format!("{e:#}"), "HTTP server failed");
                shutdown.cancel();
            }
            result
        }
    });

    // ---- Await shutdown ----
    tokio::select! {
        () = shutdown_signal() => shutdown.cancel(),
        () = shutdown.cancelled() => {}
    }

    join_tasks(http_handle, refresh_handles).await?;
    tracing::info!("git-mirror shut down cleanly");
    Ok(())
}

/// Wait for every task to stop, then surface the HTTP server's error so the
/// process exits non-zero when serving failed.
async fn join_tasks(
    http_handle: JoinHandle<Result<()>>,
    refresh_handles: Vec<JoinHandle<()>>,
) -> Result<()> {
    let served = http_handle.await.context("HTTP server task panicked");
    for handle in refresh_handles {
        let _ = handle.await;
    }
    served?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
