use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use themebox_agent::{CreateSandboxParams, LogTail, SandboxUrls, TeardownReport, tunnel::TunnelInfo};
use themebox_process::PortPair;

use crate::{error_payload::ApiError, state::AppState};

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 2000;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tunnels", get(list_tunnels))
        .route("/sandboxes", post(create_sandbox))
        .route(
            "/sandboxes/:sandbox_id",
            get(get_sandbox).delete(delete_sandbox),
        )
        .route("/sandboxes/:sandbox_id/refresh", post(refresh_sandbox))
        .route("/sandboxes/:sandbox_id/logs", get(sandbox_logs))
        .with_state(state)
}

#[derive(Debug, serde::Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
    tunnels_enabled: bool,
    open_tunnels: usize,
}

/// 200 while the sandbox store answers, 503 otherwise.
async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthzResponse>) {
    let db_ok = match state.db.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "database ping failed");
            false
        }
    };
    let tunnels = state.lifecycle.tunnels();
    let body = HealthzResponse {
        status: if db_ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: if db_ok { "ok" } else { "unreachable" },
        tunnels_enabled: tunnels.is_enabled(),
        open_tunnels: tunnels.registry().len().await,
    };
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelInfo>> {
    Json(state.lifecycle.tunnels().registry().list().await)
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(params): Json<CreateSandboxParams>,
) -> Result<(StatusCode, Json<SandboxUrls>), ApiError> {
    let urls = state.lifecycle.create(params).await?;
    Ok((StatusCode::CREATED, Json(urls)))
}

async fn refresh_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxUrls>, ApiError> {
    Ok(Json(state.lifecycle.refresh(&sandbox_id).await?))
}

async fn delete_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<TeardownReport>, ApiError> {
    Ok(Json(state.lifecycle.delete(&sandbox_id).await?))
}

/// Public view of a sandbox record; credentials are never returned.
#[derive(Debug, serde::Serialize)]
struct SandboxView {
    sandbox_id: String,
    user_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ports: Option<PortPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_url: Option<String>,
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxView>, ApiError> {
    let rec = state.lifecycle.get(&sandbox_id).await?;
    Ok(Json(SandboxView {
        sandbox_id: rec.id.0,
        user_id: rec.user_id.0,
        status: rec.status.as_str(),
        status_message: rec.status_message,
        ports: rec.ports,
        preview_url: rec.preview_url,
        public_url: rec.public_url,
        local_url: rec.local_url,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct LogsQuery {
    #[serde(default)]
    cursor: u64,
    limit: Option<usize>,
}

async fn sandbox_logs(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<LogTail>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    Ok(Json(
        state
            .lifecycle
            .tail_logs(&sandbox_id, q.cursor, limit)
            .await?,
    ))
}
