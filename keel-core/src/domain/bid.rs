//! Bid domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, NodeId};

/// A node's offer to execute a specific job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub terms: BidTerms,
    pub expires_at: DateTime<Utc>,
}

/// Terms a node proposes in its bid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidTerms {
    /// Price in the node's billing unit; lower is cheaper
    pub cost: u64,
    pub note: Option<String>,
}

impl Bid {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
