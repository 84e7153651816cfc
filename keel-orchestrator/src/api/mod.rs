//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;
pub mod node;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::service::{InMemoryCapabilityFeed, LifecycleCoordinator, QueryService};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: LifecycleCoordinator,
    pub query: QueryService,
    pub feed: Arc<InMemoryCapabilityFeed>,
}

impl AppState {
    pub fn new(coordinator: LifecycleCoordinator, feed: Arc<InMemoryCapabilityFeed>) -> Self {
        let query = QueryService::new(coordinator.store(), coordinator.config().clone());
        Self {
            coordinator,
            query,
            feed,
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Client-facing job endpoints
        .route("/job/submit", post(job::submit_job))
        .route("/job/list", get(job::list_jobs))
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/history", get(job::job_history))
        .route("/job/{id}/cancel", post(job::cancel_job))
        // Node-facing endpoints
        .route("/job/{id}/bid", post(node::place_bid))
        .route("/job/{id}/ack", post(node::acknowledge))
        .route("/job/{id}/result", post(node::report_result))
        .route("/node/advertise", post(node::advertise))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use keel_core::dto::job::SubmitJob;
    use keel_core::dto::node::AdvertiseNode;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::OrchestratorConfig;
    use crate::service::CapabilityFeed;

    fn app() -> (Router, AppState) {
        let feed = Arc::new(InMemoryCapabilityFeed::new());
        let coordinator = LifecycleCoordinator::builder(OrchestratorConfig::new())
            .with_feed(Arc::clone(&feed) as Arc<dyn CapabilityFeed>)
            .build();
        let state = AppState::new(coordinator, feed);
        (create_router(state.clone()), state)
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app();
        let response = router.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "OK");
    }

    #[tokio::test]
    async fn test_submit_and_get_job() {
        let (router, _) = app();

        let response = router
            .clone()
            .oneshot(post_json(
                "/job/submit",
                &SubmitJob::program("python", "run.py").with_namespace("team-a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        let job_id = body["JobID"].as_str().unwrap().to_string();
        assert_eq!(body["Phase"], "Submitted");

        let response = router
            .clone()
            .oneshot(get(&format!("/job/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["JobID"], job_id.as_str());
        assert_eq!(body["Namespace"], "team-a");

        let response = router
            .oneshot(get(&format!("/job/{}/history", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Items"][0]["New"], "Submitted");
    }

    #[tokio::test]
    async fn test_submit_without_entrypoint_is_rejected() {
        let (router, state) = app();
        let response = router
            .oneshot(post_json("/job/submit", &SubmitJob::default()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "ValidationError");
        assert_eq!(state.coordinator.active_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (router, _) = app();
        let response = router
            .oneshot(get(&format!("/job/{}", uuid::Uuid::new_v4())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "NotFound");
    }

    #[tokio::test]
    async fn test_list_rejects_bad_token() {
        let (router, _) = app();
        let response = router
            .oneshot(get("/job/list?next_token=garbage"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_advertise_updates_feed() {
        let (router, state) = app();

        let response = router
            .clone()
            .oneshot(post_json(
                "/node/advertise",
                &AdvertiseNode::new("node-a", 2).with_language("python", &["3.11"]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.feed.snapshot().contains_key("node-a"));

        let mut bad = AdvertiseNode::new("node-b", 1);
        bad.available_capacity = 3;
        let response = router
            .oneshot(post_json("/node/advertise", &bad))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
