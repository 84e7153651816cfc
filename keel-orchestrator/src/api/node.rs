//! Node API Handlers
//!
//! Ingestion endpoints for executor nodes: capability advertisements, bids,
//! start acknowledgements and results. Delivery is at-least-once; repeats
//! are absorbed by the coordinator.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use keel_core::dto::node::{Acknowledge, AdvertiseNode, PlaceBid, ReportResult};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /node/advertise
/// Record a node's latest capabilities
pub async fn advertise(
    State(state): State<AppState>,
    Json(req): Json<AdvertiseNode>,
) -> ApiResult<StatusCode> {
    validate_advertisement(&req)?;
    tracing::debug!("Advertisement from node {}", req.node_id);

    state.feed.advertise(req.into_capability(Utc::now()));

    Ok(StatusCode::NO_CONTENT)
}

/// POST /job/{id}/bid
pub async fn place_bid(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PlaceBid>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Bid from node {} for job {}", req.node_id, id);

    state.coordinator.deliver_bid(id, req.into_bid(id)).await?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /job/{id}/ack
pub async fn acknowledge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<Acknowledge>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Ack from node {} for job {}", req.node_id, id);

    state.coordinator.acknowledge(id, req.node_id).await?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /job/{id}/result
pub async fn report_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportResult>,
) -> ApiResult<StatusCode> {
    tracing::info!(
        "Result {} from node {} for job {}",
        req.status,
        req.node_id,
        id
    );

    state
        .coordinator
        .deliver_result(id, req.into_result(id, Utc::now()))
        .await?;

    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Validation
// =============================================================================

fn validate_advertisement(req: &AdvertiseNode) -> Result<(), ApiError> {
    if req.node_id.trim().is_empty() {
        return Err(ApiError::Validation("NodeID cannot be empty".to_string()));
    }
    if req.available_capacity > req.total_capacity {
        return Err(ApiError::Validation(format!(
            "AvailableCapacity {} exceeds TotalCapacity {}",
            req.available_capacity, req.total_capacity
        )));
    }
    if req.languages.iter().any(|l| l.language.trim().is_empty()) {
        return Err(ApiError::Validation("Language cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_advertisement() {
        let valid = AdvertiseNode::new("node-a", 4).with_language("python", &["3.11"]);
        assert!(validate_advertisement(&valid).is_ok());

        let mut over = valid.clone();
        over.available_capacity = 5;
        assert!(validate_advertisement(&over).is_err());

        assert!(validate_advertisement(&AdvertiseNode::new(" ", 1)).is_err());
        assert!(
            validate_advertisement(&AdvertiseNode::new("n", 1).with_language("", &[])).is_err()
        );
    }
}
