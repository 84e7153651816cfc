//! Health API Handler
//!
//! Liveness plus a small summary of what the orchestrator is driving.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;
use crate::service::CapabilityFeed;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Health {
    pub status: &'static str,
    pub active_jobs: usize,
    pub known_nodes: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "OK",
        active_jobs: state.coordinator.active_jobs().await,
        known_nodes: state.feed.snapshot().len(),
    })
}
