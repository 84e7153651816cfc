//! Job API Handlers
//!
//! Client-facing endpoints: submission, queries and cancellation.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use keel_core::dto::job::{
    CancelJobResponse, HistoryQuery, JobHistory, JobView, ListJobsQuery, ListResponse, SubmitJob,
    SubmitJobResponse,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /job/submit
/// Admit a new job
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    tracing::info!("Submitting {} job", req.language);

    let record = state.coordinator.submit(req).await?;

    Ok((StatusCode::CREATED, Json(SubmitJobResponse::from(&record))))
}

/// GET /job/list
///
/// Query parameters (all optional):
/// - `phase`, `submitter`, `namespace`: exact-match filters
/// - `since`, `until`: submission-time range (RFC 3339)
/// - `limit`: page size
/// - `next_token`: continuation token from the previous page
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> ApiResult<Json<ListResponse>> {
    tracing::debug!("Listing jobs: {:?}", params);

    let response = state.query.list(&params).await?;
    Ok(Json(response))
}

/// GET /job/{id}
/// Get job details by ID
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    tracing::debug!("Getting job: {}", id);

    let view = state.query.get(id).await?;
    Ok(Json(view))
}

/// GET /job/{id}/history
/// Transition history, optionally only events after `since`
pub async fn job_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<Json<JobHistory>> {
    tracing::debug!("Getting history for job: {}", id);

    let history = state.query.history_view(id, params.since).await?;
    Ok(Json(history))
}

/// POST /job/{id}/cancel
/// Cancel a job; cancelling a finished job returns it unchanged
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelJobResponse>> {
    tracing::info!("Cancelling job: {}", id);

    let record = state.coordinator.cancel(id).await?;

    Ok(Json(CancelJobResponse {
        job_id: record.id(),
        phase: record.phase,
    }))
}
