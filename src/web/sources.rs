//! Admin handlers for the source registry.

use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::data::models::{RunRecord, Source, SourceSummary};
use crate::ingest::operator::{RestartReport, StuckJob};
use crate::state::AppState;
use crate::utils::log_if_slow;
use crate::web::error::ApiError;

const SLOW_OP_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesResponse {
    pub sources: Vec<Source>,
    pub summary: SourceSummary,
}

#[derive(Debug, Deserialize)]
pub struct RunsParams {
    pub limit: Option<i64>,
}

/// `GET /api/admin/sources`
#[instrument(skip_all)]
pub async fn list_sources(State(state): State<AppState>) -> Result<Json<SourcesResponse>, ApiError> {
    let sources = state.operator.list().await?;
    let summary = SourceSummary::from_sources(&sources);
    Ok(Json(SourcesResponse { sources, summary }))
}

/// `GET /api/admin/sources/summary`
pub async fn source_summary(State(state): State<AppState>) -> Result<Json<SourceSummary>, ApiError> {
    Ok(Json(state.operator.summary().await?))
}

/// `GET /api/admin/sources/{key}`
pub async fn get_source(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.operator.get(&key).await?))
}

/// `GET /api/admin/sources/{key}/runs?limit=N`
#[instrument(skip_all, fields(source = %key))]
pub async fn source_runs(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let start = Instant::now();
    let runs = state.operator.history(&key, params.limit).await?;
    log_if_slow(start, SLOW_OP_THRESHOLD, "source_runs");
    Ok(Json(runs))
}

/// `POST /api/admin/sources/{key}/toggle`
#[instrument(skip_all, fields(source = %key))]
pub async fn toggle_source(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Source>, ApiError> {
    let source = state.operator.toggle(&key).await?;
    info!(enabled = source.enabled, "admin toggled source");
    Ok(Json(source))
}

/// `POST /api/admin/sources/{key}/restart`
#[instrument(skip_all, fields(source = %key))]
pub async fn restart_source(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RestartReport>, ApiError> {
    Ok(Json(state.operator.restart(&key, Utc::now()).await?))
}

/// `GET /api/admin/jobs/stuck`
pub async fn stuck_jobs(State(state): State<AppState>) -> Result<Json<Vec<StuckJob>>, ApiError> {
    Ok(Json(state.operator.stuck(Utc::now()).await?))
}
