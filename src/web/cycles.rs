//! Data cycle handlers: public active-cycle resolution plus admin lifecycle routes.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::cycles::lifecycle::DeletionReport;
use crate::data::models::{DataCycle, DataGroup, NewDataCycle};
use crate::state::AppState;
use crate::web::error::{ApiError, store_error};
use crate::web::extract::CycleOverride;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCycle {
    pub group: DataGroup,
    /// `null` means legacy mode: reads are not filtered by cycle.
    pub cycle_id: Option<Uuid>,
    pub overridden: bool,
}

/// `GET /api/cycles/active`
///
/// Resolves the cycle every group's reads would use for this request,
/// honouring an `X-Cycle-Id` override.
pub async fn active_cycles(
    State(state): State<AppState>,
    CycleOverride(override_id): CycleOverride,
) -> Result<Json<Vec<ResolvedCycle>>, ApiError> {
    let mut resolved = Vec::with_capacity(DataGroup::ALL.len());
    for group in DataGroup::ALL {
        let cycle_id = state
            .cycle_manager
            .active_cycle_id(group, override_id)
            .await
            .map_err(|e| store_error("Active cycle lookup", e))?;
        resolved.push(ResolvedCycle {
            group,
            cycle_id,
            overridden: override_id.is_some(),
        });
    }
    Ok(Json(resolved))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub group: Option<String>,
}

/// `GET /api/admin/cycles?group=nasr`
pub async fn list_cycles(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DataCycle>>, ApiError> {
    let group = params
        .group
        .as_deref()
        .map(str::parse::<DataGroup>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(state.cycles.list(group).await?))
}

/// `GET /api/admin/cycles/active`
pub async fn list_active(State(state): State<AppState>) -> Result<Json<Vec<DataCycle>>, ApiError> {
    Ok(Json(state.cycles.active().await?))
}

/// `GET /api/admin/cycles/pending`
pub async fn list_pending(State(state): State<AppState>) -> Result<Json<Vec<DataCycle>>, ApiError> {
    Ok(Json(state.cycles.pending(Utc::now().date_naive()).await?))
}

/// `POST /api/admin/cycles`
#[instrument(skip_all, fields(group = %body.data_group, code = %body.cycle_code))]
pub async fn create_cycle(
    State(state): State<AppState>,
    Json(body): Json<NewDataCycle>,
) -> Result<(StatusCode, Json<DataCycle>), ApiError> {
    if body.cycle_code.trim().is_empty() {
        return Err(ApiError::bad_request("cycle_code must not be empty"));
    }
    if body.expiration_date < body.effective_date {
        return Err(ApiError::bad_request(
            "expiration_date must not be before effective_date",
        ));
    }
    let cycle = state.cycles.create(body).await?;
    Ok((StatusCode::CREATED, Json(cycle)))
}

/// `GET /api/admin/cycles/{id}`
pub async fn get_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataCycle>, ApiError> {
    Ok(Json(state.cycles.get(id).await?))
}

/// `POST /api/admin/cycles/{id}/stage`
#[instrument(skip_all, fields(cycle_id = %id))]
pub async fn stage_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataCycle>, ApiError> {
    Ok(Json(state.cycles.stage(id).await?))
}

/// `POST /api/admin/cycles/{id}/activate`
#[instrument(skip_all, fields(cycle_id = %id))]
pub async fn activate_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataCycle>, ApiError> {
    Ok(Json(state.cycles.activate(id).await?))
}

/// `POST /api/admin/cycles/{id}/rollback`
#[instrument(skip_all, fields(cycle_id = %id))]
pub async fn rollback_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataCycle>, ApiError> {
    Ok(Json(state.cycles.rollback(id).await?))
}

/// `PATCH /api/admin/cycles/{id}/record-counts`
pub async fn update_record_counts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(counts): Json<BTreeMap<String, i64>>,
) -> Result<Json<DataCycle>, ApiError> {
    Ok(Json(state.cycles.update_record_counts(id, &counts).await?))
}

/// `DELETE /api/admin/cycles/{id}`
#[instrument(skip_all, fields(cycle_id = %id))]
pub async fn delete_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletionReport>, ApiError> {
    Ok(Json(state.cycles.remove(id).await?))
}
