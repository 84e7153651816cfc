//! Execution result domain types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobPhase;
use super::{JobId, NodeId};

/// Outcome of one node's execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub status: ResultStatus,
    /// Where the node published the output
    pub payload_ref: Option<String>,
    /// Digest of the output, compared across nodes for quorum
    pub verification_hash: Option<String>,
    pub message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result synthesized by the orchestrator when a node stays silent
    pub fn timed_out(job_id: JobId, node_id: NodeId, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            node_id,
            status: ResultStatus::Timeout,
            payload_ref: None,
            verification_hash: None,
            message: Some("no result before deadline".to_string()),
            reported_at: at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "Success"),
            ResultStatus::Failure => write!(f, "Failure"),
            ResultStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Job-level decision reached from one or more results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Completed,
    Failed,
}

impl Verdict {
    pub fn phase(self) -> JobPhase {
        match self {
            Verdict::Completed => JobPhase::Completed,
            Verdict::Failed => JobPhase::Failed,
        }
    }
}
