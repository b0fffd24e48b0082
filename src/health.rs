use std::path::Path;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::mirror::budget::ConcurrencyBudget;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repo_root: CheckResult,
    pub budget: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_repo_root(root: &Path) -> CheckResult {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(root.display().to_string()),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", root.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", root.display())),
    }
}

/// Informational only: an exhausted budget means every slot is refreshing.
fn check_budget(budget: &ConcurrencyBudget) -> CheckResult {
    CheckResult::healthy(format!(
        "{} of {} refresh slots available",
        budget.available(),
        budget.max()
    ))
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Returns 200 when the repository root is usable, 503 otherwise.
pub async fn health_handler(state: &AppState) -> impl IntoResponse {
    let checks = HealthChecks {
        repo_root: check_repo_root(&state.settings.root()).await,
        budget: check_budget(&state.budget),
    };

    let status = if checks.repo_root.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(HealthResponse { status, checks }))
}
