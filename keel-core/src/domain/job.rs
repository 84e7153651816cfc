//! Job domain types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bid::Bid;
use super::result::ExecutionResult;
use super::{JobId, NodeId};

/// Reasons a job specification is refused at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("job spec must set either a command or a program path")]
    MissingEntrypoint,

    #[error("job spec cannot set both a command and a program path")]
    ConflictingEntrypoint,
}

/// How the node starts the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entrypoint {
    /// Inline command handed to the language runtime
    Command(String),
    /// Program file inside the job context
    ProgramPath(String),
}

impl Entrypoint {
    /// Builds an entrypoint from the two optional request fields.
    ///
    /// Exactly one of them must be present. Blank strings count as absent.
    pub fn from_parts(
        command: Option<String>,
        program_path: Option<String>,
    ) -> Result<Self, SpecError> {
        match (non_blank(command), non_blank(program_path)) {
            (Some(command), None) => Ok(Entrypoint::Command(command)),
            (None, Some(path)) => Ok(Entrypoint::ProgramPath(path)),
            (None, None) => Err(SpecError::MissingEntrypoint),
            (Some(_), Some(_)) => Err(SpecError::ConflictingEntrypoint),
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Entrypoint::Command(command) => Some(command),
            Entrypoint::ProgramPath(_) => None,
        }
    }

    pub fn program_path(&self) -> Option<&str> {
        match self {
            Entrypoint::Command(_) => None,
            Entrypoint::ProgramPath(path) => Some(path),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Input data bundle made available to the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Where the bundle lives (e.g. `ipfs://...`, `s3://bucket/key`)
    pub source: String,
    /// Mount path inside the execution sandbox
    pub path: Option<String>,
}

/// Job specification
///
/// Immutable once submitted. Owned by the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub language: String,
    pub language_version: Option<String>,
    pub entrypoint: Entrypoint,
    pub requirements_path: Option<String>,
    pub deterministic_execution: bool,
    pub job_context: Option<JobContext>,
    pub submitter: Option<String>,
    pub namespace: Option<String>,
}

/// Lifecycle phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPhase {
    Submitted,
    Bidding,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub const ALL: [JobPhase; 7] = [
        JobPhase::Submitted,
        JobPhase::Bidding,
        JobPhase::Assigned,
        JobPhase::Running,
        JobPhase::Completed,
        JobPhase::Failed,
        JobPhase::Cancelled,
    ];

    /// No transition leaves a terminal phase
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `Assigned -> Bidding` and `Running -> Bidding` are the retry re-entry
    /// edges used when a node is abandoned.
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        use JobPhase::*;

        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Submitted, Bidding | Failed) => true,
            (Bidding, Assigned | Failed) => true,
            (Assigned, Running | Bidding | Failed) => true,
            (Running, Completed | Failed | Bidding) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Submitted => write!(f, "Submitted"),
            JobPhase::Bidding => write!(f, "Bidding"),
            JobPhase::Assigned => write!(f, "Assigned"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Why a node was abandoned and the job went back to bidding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    AckTimeout,
    ResultTimeout,
    ExecutionFailed,
    QuorumPending,
}

impl fmt::Display for ReassignReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassignReason::AckTimeout => write!(f, "no start acknowledgement"),
            ReassignReason::ResultTimeout => write!(f, "result timed out"),
            ReassignReason::ExecutionFailed => write!(f, "execution failed"),
            ReassignReason::QuorumPending => write!(f, "more results needed for quorum"),
        }
    }
}

/// What triggered a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionCause {
    Submitted,
    NodesMatched { count: usize },
    BidAccepted { node_id: NodeId },
    Acknowledged { node_id: NodeId },
    ResultAccepted { node_id: NodeId },
    Reassigned { node_id: NodeId, reason: ReassignReason },
    Validation { message: String },
    NoEligibleNodes,
    BidTimeout,
    AckTimeout { node_id: NodeId },
    ResultTimeout { node_id: NodeId },
    ExecutionFailed { node_id: NodeId, message: Option<String> },
    CancelRequested,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionCause::Submitted => write!(f, "job submitted"),
            TransitionCause::NodesMatched { count } => write!(f, "{} eligible node(s)", count),
            TransitionCause::BidAccepted { node_id } => write!(f, "bid from {} accepted", node_id),
            TransitionCause::Acknowledged { node_id } => write!(f, "{} started execution", node_id),
            TransitionCause::ResultAccepted { node_id } => {
                write!(f, "result from {} accepted", node_id)
            }
            TransitionCause::Reassigned { node_id, reason } => {
                write!(f, "reassigned away from {}: {}", node_id, reason)
            }
            TransitionCause::Validation { message } => write!(f, "validation failed: {}", message),
            TransitionCause::NoEligibleNodes => write!(f, "no eligible nodes"),
            TransitionCause::BidTimeout => write!(f, "bidding window elapsed without bids"),
            TransitionCause::AckTimeout { node_id } => {
                write!(f, "{} did not acknowledge the assignment", node_id)
            }
            TransitionCause::ResultTimeout { node_id } => {
                write!(f, "{} did not report a result in time", node_id)
            }
            TransitionCause::ExecutionFailed { node_id, message } => match message {
                Some(message) => write!(f, "execution on {} failed: {}", node_id, message),
                None => write!(f, "execution on {} failed", node_id),
            },
            TransitionCause::CancelRequested => write!(f, "cancelled by request"),
        }
    }
}

/// One entry of a job's transition sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// 1-based position in the job's sequence
    pub seq: u64,
    /// `None` only for the initial `Submitted` event
    pub from: Option<JobPhase>,
    pub to: JobPhase,
    pub at: DateTime<Utc>,
    pub cause: TransitionCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobPhase),

    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobPhase, to: JobPhase },
}

/// Job state record
///
/// The unit the job store persists. The lifecycle coordinator is its only
/// writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub phase: JobPhase,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<TransitionEvent>,
    pub bids: BTreeMap<NodeId, Bid>,
    pub results: BTreeMap<NodeId, ExecutionResult>,
    pub assigned_node: Option<NodeId>,
    pub excluded_nodes: BTreeSet<NodeId>,
    pub reassignments: u32,
    /// Number of successful store writes; used for optimistic concurrency
    pub revision: u64,
}

impl JobRecord {
    pub fn new(spec: JobSpec, submitted_at: DateTime<Utc>) -> Self {
        Self {
            spec,
            phase: JobPhase::Submitted,
            submitted_at,
            updated_at: submitted_at,
            events: vec![TransitionEvent {
                seq: 1,
                from: None,
                to: JobPhase::Submitted,
                at: submitted_at,
                cause: TransitionCause::Submitted,
            }],
            bids: BTreeMap::new(),
            results: BTreeMap::new(),
            assigned_node: None,
            excluded_nodes: BTreeSet::new(),
            reassignments: 0,
            revision: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.spec.id
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn last_event(&self) -> Option<&TransitionEvent> {
        self.events.last()
    }

    /// Moves the record to `to` and appends the transition event
    pub fn transition(
        &mut self,
        to: JobPhase,
        cause: TransitionCause,
        at: DateTime<Utc>,
    ) -> Result<&TransitionEvent, TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::Terminal(self.phase));
        }
        if !self.phase.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                from: self.phase,
                to,
            });
        }

        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(TransitionEvent {
            seq,
            from: Some(self.phase),
            to,
            at,
            cause,
        });
        self.phase = to;
        self.updated_at = at;

        Ok(&self.events[self.events.len() - 1])
    }

    /// Checks that the transition sequence is a legal walk of the state machine
    pub fn has_valid_path(&self) -> bool {
        let Some(first) = self.events.first() else {
            return false;
        };
        if first.from.is_some() || first.to != JobPhase::Submitted || first.seq != 1 {
            return false;
        }

        let walk_ok = self.events.windows(2).all(|pair| {
            let (prev, next) = (&pair[0], &pair[1]);
            next.seq == prev.seq + 1
                && next.from == Some(prev.to)
                && prev.to.can_transition_to(next.to)
        });

        walk_ok && self.events.last().map(|e| e.to) == Some(self.phase)
    }

    /// Rebuilds the latest record from its audit trail
    pub fn replay<'a, I>(entries: I) -> Option<JobRecord>
    where
        I: IntoIterator<Item = &'a AuditEntry>,
    {
        entries
            .into_iter()
            .fold(None::<&AuditEntry>, |latest, entry| match latest {
                Some(current) if current.revision >= entry.revision => Some(current),
                _ => Some(entry),
            })
            .map(|entry| entry.record.clone())
    }
}

/// Append-only audit log entry, one per successful store write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the store-wide log
    pub seq: u64,
    pub job_id: JobId,
    pub revision: u64,
    pub recorded_at: DateTime<Utc>,
    /// Transition appended by this write, if any
    pub event: Option<TransitionEvent>,
    /// Record as stored by this write
    pub record: JobRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec() -> JobSpec {
        JobSpec {
            id: uuid::Uuid::new_v4(),
            language: "python".to_string(),
            language_version: Some("3.11".to_string()),
            entrypoint: Entrypoint::ProgramPath("run.py".to_string()),
            requirements_path: None,
            deterministic_execution: true,
            job_context: None,
            submitter: None,
            namespace: None,
        }
    }

    #[test]
    fn test_entrypoint_requires_exactly_one() {
        assert_eq!(
            Entrypoint::from_parts(Some("print(1)".into()), None),
            Ok(Entrypoint::Command("print(1)".into()))
        );
        assert_eq!(
            Entrypoint::from_parts(None, Some("run.py".into())),
            Ok(Entrypoint::ProgramPath("run.py".into()))
        );
        assert_eq!(
            Entrypoint::from_parts(None, None),
            Err(SpecError::MissingEntrypoint)
        );
        assert_eq!(
            Entrypoint::from_parts(Some("x".into()), Some("y".into())),
            Err(SpecError::ConflictingEntrypoint)
        );
    }

    #[test]
    fn test_blank_entrypoint_counts_as_absent() {
        assert_eq!(
            Entrypoint::from_parts(Some("   ".into()), Some("run.py".into())),
            Ok(Entrypoint::ProgramPath("run.py".into()))
        );
    }

    #[test]
    fn test_terminal_phases() {
        let terminal: Vec<_> = JobPhase::ALL
            .into_iter()
            .filter(|p| p.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![JobPhase::Completed, JobPhase::Failed, JobPhase::Cancelled]
        );
    }

    #[test]
    fn test_cancel_allowed_from_every_non_terminal_phase() {
        for phase in JobPhase::ALL {
            assert_eq!(
                phase.can_transition_to(JobPhase::Cancelled),
                !phase.is_terminal()
            );
        }
    }

    #[test]
    fn test_no_edge_leaves_terminal_phase() {
        for from in JobPhase::ALL.into_iter().filter(|p| p.is_terminal()) {
            for to in JobPhase::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let now = Utc::now();
        let mut record = JobRecord::new(spec(), now);

        record
            .transition(JobPhase::Bidding, TransitionCause::NodesMatched { count: 1 }, now)
            .unwrap();
        record
            .transition(
                JobPhase::Assigned,
                TransitionCause::BidAccepted { node_id: "n1".into() },
                now,
            )
            .unwrap();
        record
            .transition(
                JobPhase::Running,
                TransitionCause::Acknowledged { node_id: "n1".into() },
                now,
            )
            .unwrap();
        record
            .transition(
                JobPhase::Completed,
                TransitionCause::ResultAccepted { node_id: "n1".into() },
                now,
            )
            .unwrap();

        assert_eq!(record.phase, JobPhase::Completed);
        assert_eq!(record.events.len(), 5);
        assert!(record.has_valid_path());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let now = Utc::now();
        let mut record = JobRecord::new(spec(), now);

        let err = record
            .transition(
                JobPhase::Running,
                TransitionCause::Acknowledged { node_id: "n1".into() },
                now,
            )
            .unwrap_err();

        assert_eq!(
            err,
            TransitionError::Illegal {
                from: JobPhase::Submitted,
                to: JobPhase::Running
            }
        );
        assert_eq!(record.events.len(), 1);
    }

    #[test]
    fn test_terminal_record_rejects_transitions() {
        let now = Utc::now();
        let mut record = JobRecord::new(spec(), now);
        record
            .transition(JobPhase::Cancelled, TransitionCause::CancelRequested, now)
            .unwrap();

        let err = record
            .transition(JobPhase::Cancelled, TransitionCause::CancelRequested, now)
            .unwrap_err();
        assert_eq!(err, TransitionError::Terminal(JobPhase::Cancelled));
    }

    #[test]
    fn test_replay_picks_latest_revision() {
        let now = Utc::now();
        let mut record = JobRecord::new(spec(), now);
        record.revision = 1;
        let first = AuditEntry {
            seq: 1,
            job_id: record.id(),
            revision: 1,
            recorded_at: now,
            event: record.last_event().cloned(),
            record: record.clone(),
        };

        record
            .transition(JobPhase::Failed, TransitionCause::NoEligibleNodes, now)
            .unwrap();
        record.revision = 2;
        let second = AuditEntry {
            seq: 7,
            job_id: record.id(),
            revision: 2,
            recorded_at: now,
            event: record.last_event().cloned(),
            record: record.clone(),
        };

        let replayed = JobRecord::replay([&second, &first]).unwrap();
        assert_eq!(replayed, record);
        assert!(JobRecord::replay(std::iter::empty()).is_none());
    }

    fn phase_strategy() -> impl Strategy<Value = JobPhase> {
        prop::sample::select(JobPhase::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn test_random_walks_keep_valid_path(steps in prop::collection::vec(phase_strategy(), 0..24)) {
            let now = Utc::now();
            let mut record = JobRecord::new(spec(), now);

            for to in steps {
                let _ = record.transition(to, TransitionCause::CancelRequested, now);
            }

            prop_assert!(record.has_valid_path());
        }
    }
}
