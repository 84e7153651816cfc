//! Node transport
//!
//! Outbound signalling from the orchestrator to executor nodes. Every call
//! is best effort: failures are reported to the caller, which logs them and
//! relies on timeouts to recover.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::job::JobSpec;
use keel_core::domain::node::NodeCapability;
use keel_core::dto::node::{AssignJob, BidRequest, CancelExecution};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

/// Transport trait for orchestrator -> node messages
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Invites a matched node to bid on a job
    async fn request_bids(&self, node: &NodeCapability, request: &BidRequest) -> Result<()>;

    /// Hands the job to the node whose bid was accepted
    async fn assign(&self, node: &NodeCapability, spec: &JobSpec) -> Result<()>;

    /// Tells a node to stop working on a job
    async fn cancel(&self, node: &NodeCapability, request: &CancelExecution) -> Result<()>;
}

/// Transport that only logs; nodes are expected to poll or be driven by tests
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransport;

#[async_trait]
impl NodeTransport for LoggingTransport {
    async fn request_bids(&self, node: &NodeCapability, request: &BidRequest) -> Result<()> {
        debug!(
            "Bid request for job {} to node {} (deadline {})",
            request.job_id, node.node_id, request.bid_deadline
        );
        Ok(())
    }

    async fn assign(&self, node: &NodeCapability, spec: &JobSpec) -> Result<()> {
        info!("Job {} assigned to node {}", spec.id, node.node_id);
        Ok(())
    }

    async fn cancel(&self, node: &NodeCapability, request: &CancelExecution) -> Result<()> {
        info!("Cancel for job {} sent to node {}", request.job_id, node.node_id);
        Ok(())
    }
}

/// Transport that posts JSON to each node's advertised endpoint
pub struct HttpNodeTransport {
    client: Client,
}

impl HttpNodeTransport {
    /// Creates a transport whose every call is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build node HTTP client")?;

        Ok(Self::with_client(client))
    }

    /// Creates a transport with a preconfigured reqwest client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        node: &NodeCapability,
        path: &str,
        body: &T,
    ) -> Result<()> {
        let Some(endpoint) = node.endpoint.as_deref() else {
            debug!("Node {} has no endpoint; skipping {}", node.node_id, path);
            return Ok(());
        };
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach node {}", node.node_id))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Node {} rejected {}: {} - {}", node.node_id, path, status, body);
        }

        Ok(())
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn request_bids(&self, node: &NodeCapability, request: &BidRequest) -> Result<()> {
        self.post(node, "/bid-request", request).await
    }

    async fn assign(&self, node: &NodeCapability, spec: &JobSpec) -> Result<()> {
        self.post(node, "/assign", &AssignJob::from(spec)).await
    }

    async fn cancel(&self, node: &NodeCapability, request: &CancelExecution) -> Result<()> {
        self.post(node, "/cancel", request).await
    }
}
