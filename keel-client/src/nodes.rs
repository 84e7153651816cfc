//! Node-facing API endpoints
//!
//! Used by executor nodes. Bids, acknowledgements and results are safe to
//! repeat: the orchestrator ignores a second delivery from the same node.

use keel_core::dto::node::{Acknowledge, AdvertiseNode, PlaceBid, ReportResult};
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};

impl OrchestratorClient {
    /// Advertise (or refresh) this node's capabilities
    pub async fn advertise_node(&self, advert: &AdvertiseNode) -> Result<()> {
        if advert.available_capacity > advert.total_capacity {
            return Err(ClientError::InvalidRequest(format!(
                "AvailableCapacity {} exceeds TotalCapacity {}",
                advert.available_capacity, advert.total_capacity
            )));
        }

        let response = self
            .client
            .post(self.url("/node/advertise"))
            .json(advert)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Bid on a job this node was invited to
    pub async fn send_bid(&self, job_id: Uuid, bid: &PlaceBid) -> Result<()> {
        let url = self.url(&format!("/job/{}/bid", job_id));
        let response = self.client.post(&url).json(bid).send().await?;

        self.handle_empty_response(response).await
    }

    /// Acknowledge that execution of an assigned job started
    pub async fn acknowledge(&self, job_id: Uuid, node_id: &str) -> Result<()> {
        let url = self.url(&format!("/job/{}/ack", job_id));
        let response = self
            .client
            .post(&url)
            .json(&Acknowledge {
                node_id: node_id.to_string(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Report the outcome of an execution
    pub async fn send_result(&self, job_id: Uuid, result: &ReportResult) -> Result<()> {
        let url = self.url(&format!("/job/{}/result", job_id));
        let response = self.client.post(&url).json(result).send().await?;

        self.handle_empty_response(response).await
    }
}
