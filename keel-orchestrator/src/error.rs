//! Scheduler errors
//!
//! Error taxonomy shared by the store, matcher, coordinator and query layer.

use keel_core::domain::JobId;
use keel_core::domain::job::{JobPhase, SpecError, TransitionCause, TransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job spec is malformed and was never admitted
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no eligible nodes for job {0}")]
    NoEligibleNodes(JobId),

    #[error("bidding window for job {0} elapsed without valid bids")]
    BidTimeout(JobId),

    #[error("node {node_id} did not acknowledge job {job_id}")]
    AckTimeout { job_id: JobId, node_id: String },

    #[error("node {node_id} did not report a result for job {job_id}")]
    ResultTimeout { job_id: JobId, node_id: String },

    #[error("job {0} not found")]
    NotFound(JobId),

    /// A concurrent writer committed first; re-read and reapply
    #[error("write conflict on job {job_id}: expected revision {expected}, found {found}")]
    StoreWriteConflict {
        job_id: JobId,
        expected: u64,
        found: u64,
    },

    #[error("invalid transition for job {job_id}: {source}")]
    InvalidTransition {
        job_id: JobId,
        #[source]
        source: TransitionError,
    },

    /// The job reached a terminal phase before the request was applied
    #[error("job {job_id} is already {phase}")]
    Terminal { job_id: JobId, phase: JobPhase },

    /// Bid, ack or result that does not fit the job's current state
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("store error: {0}")]
    Store(String),
}

impl SchedulerError {
    pub fn invalid_transition(job_id: JobId, source: TransitionError) -> Self {
        match source {
            TransitionError::Terminal(phase) => SchedulerError::Terminal { job_id, phase },
            source => SchedulerError::InvalidTransition { job_id, source },
        }
    }

    /// Whether retrying the operation can succeed without outside help
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::NoEligibleNodes(_)
                | SchedulerError::StoreWriteConflict { .. }
                | SchedulerError::Store(_)
        )
    }

    /// Cause recorded on the job when this error ends an attempt
    pub fn transition_cause(&self) -> Option<TransitionCause> {
        match self {
            SchedulerError::Validation(message) => Some(TransitionCause::Validation {
                message: message.clone(),
            }),
            SchedulerError::NoEligibleNodes(_) => Some(TransitionCause::NoEligibleNodes),
            SchedulerError::BidTimeout(_) => Some(TransitionCause::BidTimeout),
            SchedulerError::AckTimeout { node_id, .. } => Some(TransitionCause::AckTimeout {
                node_id: node_id.clone(),
            }),
            SchedulerError::ResultTimeout { node_id, .. } => Some(TransitionCause::ResultTimeout {
                node_id: node_id.clone(),
            }),
            _ => None,
        }
    }
}

impl From<SpecError> for SchedulerError {
    fn from(err: SpecError) -> Self {
        SchedulerError::Validation(err.to_string())
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Store(format!("record encoding: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
