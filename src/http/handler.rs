//! Main axum router and HTTP request handlers for the git mirror.
//!
//! Routes:
//! - `GET  /healthz` - Health check
//! - `GET  /metrics` - Prometheus metrics
//! - everything else is matched against the git route table
//!   ([`super::routes::RouteTable`]):
//!   smart HTTP (`info/refs`, `git-upload-pack`, `git-receive-pack`) and the
//!   dumb-protocol repository files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode, Version},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use super::access::has_access;
use super::pktline::service_banner;
use super::routes::Operation;
use super::static_files::{self, CachePolicy};
use crate::git::{bare_repo, bridge, commands};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Everything a git operation needs about one matched request.
pub struct RequestContext {
    pub parts: Parts,
    pub body: Body,
    /// `upload-pack` / `receive-pack` for RPC routes.
    pub rpc: Option<&'static str>,
    /// Resolved on-disk repository directory.
    pub dir: PathBuf,
    /// Requested file relative to `dir`.
    pub file: String,
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Fallback handler: dispatch a request through the git route table.
async fn handle_git(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        %remote,
        method = %parts.method,
        path = %parts.uri.path(),
        version = ?parts.version,
        "request"
    );

    // Route patterns and repository directories are matched on the decoded
    // path; a path that does not decode to UTF-8 matches nothing.
    let decoded = percent_decode_str(parts.uri.path())
        .decode_utf8()
        .map(|path| path.into_owned());
    let matched = match &decoded {
        Ok(path) => state
            .routes
            .resolve(path.strip_prefix('/').unwrap_or(path)),
        Err(e) => {
            debug!(path = %parts.uri.path(), error = %e, "request path is not UTF-8");
            None
        }
    };
    let (label, result) = match matched {
        Some(m) => {
            let label = m.operation.label();
            let operation = m.operation;
            let result = if parts.method != *m.method {
                Err(AppError::MethodNotAllowed(parts.version))
            } else {
                match bare_repo::resolve_repo_dir(&state.settings.root(), &m.repo).await {
                    Some(dir) => {
                        let ctx = RequestContext {
                            rpc: m.rpc,
                            dir,
                            file: m.file,
                            parts,
                            body,
                        };
                        dispatch(&state, operation, ctx).await
                    }
                    None => Err(AppError::NotFound),
                }
            };
            (label, result)
        }
        None => ("unmatched", Err(AppError::NotFound)),
    };

    let response = result.unwrap_or_else(|e| e.into_response());
    state
        .metrics
        .metrics
        .record_request(label, response.status().as_u16());
    response
}

/// Run the handler for a matched operation.
pub async fn dispatch(
    state: &AppState,
    operation: Operation,
    ctx: RequestContext,
) -> Result<Response, AppError> {
    match operation {
        Operation::ServiceRpc => service_rpc(state, ctx).await,
        Operation::InfoRefs => get_info_refs(state, ctx).await,
        Operation::TextFile => serve(ctx, static_files::TEXT_PLAIN, CachePolicy::NoCache).await,
        Operation::InfoPacks => {
            serve(ctx, static_files::TEXT_PLAIN_UTF8, CachePolicy::Forever).await
        }
        Operation::LooseObject => {
            serve(ctx, static_files::LOOSE_OBJECT, CachePolicy::Forever).await
        }
        Operation::PackFile => {
            serve(ctx, static_files::PACKED_OBJECTS, CachePolicy::Forever).await
        }
        Operation::IdxFile => {
            serve(ctx, static_files::PACKED_OBJECTS_TOC, CachePolicy::Forever).await
        }
    }
}

/// `POST <repo>/git-upload-pack`, `POST <repo>/git-receive-pack`
///
/// Streams the request body through `git <rpc> --stateless-rpc` and the
/// subprocess output back as a chunked response.
#[instrument(skip_all, fields(rpc = ctx.rpc.unwrap_or_default(), dir = %ctx.dir.display()))]
async fn service_rpc(state: &AppState, ctx: RequestContext) -> Result<Response, AppError> {
    let rpc = ctx.rpc.unwrap_or_default();
    let headers = &ctx.parts.headers;

    if !has_access(&state.settings, headers, &ctx.dir, rpc, true).await {
        warn!("rpc access denied");
        return Err(AppError::Forbidden);
    }

    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"));

    let command = bridge::RpcCommand {
        git_bin: state.settings.git_bin_path.clone(),
        rpc: rpc.to_string(),
        dir: ctx.dir.clone(),
        env: bridge::rpc_env(&state.settings, headers),
        gzip,
    };
    let body = bridge::spawn_rpc(command, ctx.body).await?;

    let content_type = HeaderValue::from_str(&format!("application/x-git-{rpc}-result"))
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (header::TRANSFER_ENCODING, HeaderValue::from_static("chunked")),
            (
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ),
        ],
        body,
    )
        .into_response())
}

/// `GET <repo>/info/refs?service=git-<service>`
///
/// Smart ref advertisement when the service is allowed; otherwise the dumb
/// `info/refs` file, refreshed with `git update-server-info` first.
#[instrument(skip_all, fields(dir = %ctx.dir.display()))]
async fn get_info_refs(state: &AppState, ctx: RequestContext) -> Result<Response, AppError> {
    let headers = &ctx.parts.headers;
    let service = Query::<InfoRefsQuery>::try_from_uri(&ctx.parts.uri)
        .ok()
        .and_then(|Query(q)| q.service)
        .and_then(|s| s.strip_prefix("git-").map(str::to_string))
        .unwrap_or_default();
    let protocol = bridge::git_protocol(headers);

    if !has_access(&state.settings, headers, &ctx.dir, &service, false).await {
        info!(%service, "serving dumb info/refs");
        if let Err(e) = commands::git_update_server_info(&state.settings.git_bin_path, &ctx.dir).await
        {
            warn!(error = %format!("{e:#}"), "git update-server-info failed");
        }
        return static_files::send_file(
            &ctx.dir,
            "info/refs",
            headers,
            static_files::TEXT_PLAIN_UTF8,
            CachePolicy::NoCache,
        )
        .await;
    }

    let refs =
        commands::git_advertise_refs(&state.settings.git_bin_path, &ctx.dir, &service, protocol)
            .await?;

    let mut body = Vec::with_capacity(refs.len() + 64);
    if protocol.is_none() {
        body.extend_from_slice(&service_banner(&service));
    }
    body.extend_from_slice(&refs);

    let content_type =
        HeaderValue::from_str(&format!("application/x-git-{service}-advertisement"))
            .map_err(|e| AppError::Internal(e.into()))?;
    let mut response = (StatusCode::OK, body).into_response();
    static_files::apply_cache_policy(response.headers_mut(), CachePolicy::NoCache);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}

/// Dumb-protocol file routes.
async fn serve(
    ctx: RequestContext,
    content_type: &'static str,
    policy: CachePolicy,
) -> Result<Response, AppError> {
    static_files::send_file(&ctx.dir, &ctx.file, &ctx.parts.headers, content_type, policy).await
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(&state).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the server.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// No route, no repository or no file.
    NotFound,
    /// The route exists but takes a different method.  HTTP/1.1 clients get
    /// a 405, anything else a 400.
    MethodNotAllowed(Version),
    /// Access control refused the service.
    Forbidden,
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            AppError::MethodNotAllowed(version) if version == Version::HTTP_11 => {
                (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
            }
            AppError::MethodNotAllowed(_) => {
                (StatusCode::BAD_REQUEST, "Bad Request").into_response()
            }
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
