//! Streaming bridge between an HTTP exchange and `git <rpc> --stateless-rpc`.
//!
//! The request body is copied into the subprocess's stdin (gunzipped on the
//! fly when the client compressed it) while stdout is pumped into the
//! response body one chunk at a time.  Each chunk becomes its own body frame,
//! so hyper writes and flushes it as a separate HTTP chunk instead of
//! buffering the whole pack.
//!
//! A client that disconnects mid-stream drops the response body; the pump
//! notices the closed channel, logs it, and drains the remaining output so
//! the subprocess can finish.  Any other failure ends this one response with
//! an error and never affects other requests.

use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap};
use base64::Engine as _;
use bytes::Bytes;
use flate2::write::GzDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::SmartHttpSettings;

/// Size of a single stdout read, and therefore the largest response chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Body frames buffered between the pump and hyper.
const CHANNEL_DEPTH: usize = 16;

/// A stateless RPC invocation ready to be spawned.
#[derive(Debug, Clone)]
pub struct RpcCommand {
    pub git_bin: PathBuf,
    /// `upload-pack` or `receive-pack`.
    pub rpc: String,
    pub dir: PathBuf,
    /// The complete subprocess environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    /// The request body is gzip-compressed.
    pub gzip: bool,
}

/// How the stdout pump ended.
#[derive(Debug, PartialEq, Eq)]
enum PumpOutcome {
    /// All output was forwarded.
    Completed { bytes: u64 },
    /// The client went away; remaining output was discarded.
    ClientClosed { forwarded: u64, discarded: u64 },
    /// Reading from the subprocess failed.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Build the environment for an RPC subprocess.
///
/// The list replaces the server environment entirely: the configured default
/// `KEY=VALUE`, the basic-auth user and password under their configured
/// variable names (only when the request carries credentials), and
/// `GIT_PROTOCOL` when the client sent a `Git-Protocol` header.
pub fn rpc_env(settings: &SmartHttpSettings, headers: &HeaderMap) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if let Some((key, value)) = settings.default_env.split_once('=') {
        if !key.is_empty() {
            env.push((key.to_string(), value.to_string()));
        }
    }

    if let Some((user, password)) = basic_auth(headers) {
        if !settings.auth_user_env_var.is_empty() {
            env.push((settings.auth_user_env_var.clone(), user));
        }
        if !settings.auth_pass_env_var.is_empty() {
            env.push((settings.auth_pass_env_var.clone(), password));
        }
    }

    if let Some(version) = git_protocol(headers) {
        env.push(("GIT_PROTOCOL".to_string(), version.to_string()));
    }

    env
}

/// The client's `Git-Protocol` header, if present and non-empty.
pub fn git_protocol(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Decode `Authorization: Basic <base64(user:password)>`.
pub fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the RPC subprocess and return the response body that streams its
/// output.
///
/// Spawn failures are returned before any response is produced.  Everything
/// after that runs in a background task which owns the child until it exits.
pub async fn spawn_rpc(command: RpcCommand, request_body: Body) -> Result<Body> {
    let mut cmd = Command::new(&command.git_bin);
    cmd.arg(&command.rpc)
        .arg("--stateless-rpc")
        .arg(&command.dir)
        .current_dir(&command.dir)
        .env_clear()
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn git {}", command.rpc))?;

    let stdin = child
        .stdin
        .take()
        .with_context(|| format!("failed to open git {} stdin", command.rpc))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("failed to capture git {} stdout", command.rpc))?;

    debug!(rpc = %command.rpc, dir = %command.dir.display(), "spawned stateless rpc");

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(run_bridge(child, stdin, stdout, request_body, command, tx));

    Ok(Body::from_stream(ReceiverStream::new(rx)))
}

/// Drive one RPC exchange to completion.
async fn run_bridge<W, R>(
    mut child: Child,
    stdin: W,
    stdout: R,
    request_body: Body,
    command: RpcCommand,
    tx: mpsc::Sender<io::Result<Bytes>>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin,
{
    let rpc = command.rpc.as_str();
    let feed = tokio::spawn(copy_request_body(request_body, stdin, command.gzip));

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        })
    });

    let outcome = pump_stdout(stdout, &tx).await;
    match &outcome {
        PumpOutcome::Completed { bytes } => debug!(%rpc, bytes, "rpc output streamed"),
        PumpOutcome::ClientClosed {
            forwarded,
            discarded,
        } => info!(
            %rpc,
            forwarded,
            discarded,
            "client connection closed; discarding remaining rpc output"
        ),
        PumpOutcome::Failed(e) => error!(%rpc, error = %e, "failed to stream rpc output"),
    }

    match feed.await {
        Ok(Ok(bytes)) => debug!(%rpc, bytes, "request body copied to rpc stdin"),
        Ok(Err(e)) if is_broken_pipe(&e) => debug!(
            %rpc,
            "rpc exited before reading the whole request body"
        ),
        Ok(Err(e)) => {
            warn!(%rpc, error = %format!("{e:#}"), "failed to copy request body to rpc stdin");
            if matches!(outcome, PumpOutcome::Completed { .. }) {
                let _ = tx.send(Err(io::Error::other(format!("{e:#}")))).await;
            }
        }
        Err(e) => error!(%rpc, error = %e, "request body task failed"),
    }
    drop(tx);

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    match child.wait().await {
        Ok(status) if !status.success() => warn!(
            %rpc,
            %status,
            stderr = %String::from_utf8_lossy(&stderr).trim(),
            "git rpc exited with non-zero status"
        ),
        Ok(_) => debug!(%rpc, "git rpc exited"),
        Err(e) => error!(%rpc, error = %e, "failed to wait on git rpc"),
    }
}

// ---------------------------------------------------------------------------
// Request body → stdin
// ---------------------------------------------------------------------------

/// True when `err` came from writing to a stdin the subprocess already
/// closed.  Git answers some requests without reading all of its input.
fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::BrokenPipe)
}

/// Copy the request body into `stdin`, gunzipping it when `gzip` is set, then
/// close `stdin` so the subprocess sees end-of-input.  Returns the number of
/// bytes written.
async fn copy_request_body<W>(body: Body, mut stdin: W, gzip: bool) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = body.into_data_stream();
    let mut decoder = gzip.then(|| GzDecoder::new(Vec::new()));
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("failed to read request body")?;
        match decoder.as_mut() {
            Some(decoder) => {
                decoder
                    .write_all(&chunk)
                    .context("invalid gzip request body")?;
                let plain = std::mem::take(decoder.get_mut());
                stdin
                    .write_all(&plain)
                    .await
                    .context("failed to write to rpc stdin")?;
                written += plain.len() as u64;
            }
            None => {
                stdin
                    .write_all(&chunk)
                    .await
                    .context("failed to write to rpc stdin")?;
                written += chunk.len() as u64;
            }
        }
    }

    if let Some(decoder) = decoder {
        let tail = decoder.finish().context("truncated gzip request body")?;
        stdin
            .write_all(&tail)
            .await
            .context("failed to write to rpc stdin")?;
        written += tail.len() as u64;
    }

    stdin
        .shutdown()
        .await
        .context("failed to close rpc stdin")?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// stdout → response body
// ---------------------------------------------------------------------------

/// Forward `stdout` to `tx` in chunks of at most [`CHUNK_SIZE`] bytes.
async fn pump_stdout<R>(mut stdout: R, tx: &mpsc::Sender<io::Result<Bytes>>) -> PumpOutcome
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut forwarded: u64 = 0;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => return PumpOutcome::Completed { bytes: forwarded },
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let msg = e.to_string();
                let _ = tx.send(Err(e)).await;
                return PumpOutcome::Failed(msg);
            }
        };

        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
            let discarded = tokio::io::copy(&mut stdout, &mut tokio::io::sink())
                .await
                .unwrap_or(0);
            return PumpOutcome::ClientClosed {
                forwarded,
                discarded: discarded + n as u64,
            };
        }
        forwarded += n as u64;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
