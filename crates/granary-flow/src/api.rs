//! HTTP API.
//!
//! A small axum surface for operators: health and readiness probes,
//! run inspection, resubmission, and a Prometheus metrics endpoint.
//! Errors come back as JSON `{"error": "..."}` with a matching status
//! code.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use granary_core::RunId;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::metrics::prometheus_handle;
use crate::run::{JobRun, RunStatus};
use crate::scheduler::JobScheduler;
use crate::store::RunFilter;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    /// The scheduler behind the API.
    pub scheduler: JobScheduler,
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// An API-level error: a status code and a message for the body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::RunNotFound { .. } => StatusCode::NOT_FOUND,
            Error::NotResubmittable { .. } => StatusCode::CONFLICT,
            Error::Core(granary_core::Error::InvalidId { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

/// Builds the API router.
#[must_use]
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/runs", get(list_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/resubmit", post(resubmit_run))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until shutdown is signaled.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let router = api_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::backend(format!("api server error: {e}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ready" }))
}

fn parse_run_id(raw: &str) -> std::result::Result<RunId, ApiError> {
    RunId::from_str(raw).map_err(|_| ApiError::bad_request(format!("invalid run id '{raw}'")))
}

async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> std::result::Result<Json<JobRun>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.scheduler.status(run_id).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    definition: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> std::result::Result<Json<Vec<JobRun>>, ApiError> {
    let mut filter = RunFilter::new();
    if let Some(definition) = params.definition {
        filter = filter.with_definition(definition);
    }
    if let Some(raw) = params.status {
        let status = RunStatus::from_str(&raw)
            .map_err(|_| ApiError::bad_request(format!("unknown run status '{raw}'")))?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = params.limit {
        filter = filter.with_limit(limit);
    }
    let runs = state.scheduler.list_runs(&filter).await?;
    Ok(Json(runs))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResubmitResponse {
    run_id: RunId,
    resubmit_of: RunId,
}

async fn resubmit_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> std::result::Result<Json<ResubmitResponse>, ApiError> {
    let original = parse_run_id(&run_id)?;
    let new_run = state.scheduler.resubmit(original).await?;
    Ok(Json(ResubmitResponse {
        run_id: new_run,
        resubmit_of: original,
    }))
}

async fn render_metrics() -> Response {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "metrics recorder not installed".to_string(),
            }),
        )
            .into_response(),
    }
}
