//! Job DTOs
//!
//! Request bodies for submission and the read-only projections returned by
//! the query layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{
    Entrypoint, JobContext, JobPhase, JobRecord, JobSpec, SpecError, TransitionEvent,
};
use crate::dto::WireModel;

/// Input bundle reference as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobContextRef {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WireModel for JobContextRef {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] =
        &[("source", "Source"), ("path", "Path")];
}

impl From<JobContext> for JobContextRef {
    fn from(context: JobContext) -> Self {
        Self {
            source: context.source,
            path: context.path,
        }
    }
}

impl From<JobContextRef> for JobContext {
    fn from(context: JobContextRef) -> Self {
        Self {
            source: context.source,
            path: context.path,
        }
    }
}

/// Request to submit a new job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubmitJob {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_path: Option<String>,
    #[serde(default)]
    pub deterministic_execution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_context: Option<JobContextRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl WireModel for SubmitJob {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("language", "Language"),
        ("language_version", "LanguageVersion"),
        ("command", "Command"),
        ("program_path", "ProgramPath"),
        ("requirements_path", "RequirementsPath"),
        ("deterministic_execution", "DeterministicExecution"),
        ("job_context", "JobContext"),
        ("submitter", "Submitter"),
        ("namespace", "Namespace"),
    ];
}

impl SubmitJob {
    /// Job that runs a program file
    pub fn program(language: impl Into<String>, program_path: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            program_path: Some(program_path.into()),
            ..Default::default()
        }
    }

    /// Job that runs an inline command
    pub fn command(language: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.language_version = Some(version.into());
        self
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic_execution = deterministic;
        self
    }

    pub fn with_requirements(mut self, path: impl Into<String>) -> Self {
        self.requirements_path = Some(path.into());
        self
    }

    pub fn with_context(mut self, source: impl Into<String>, path: Option<String>) -> Self {
        self.job_context = Some(JobContextRef {
            source: source.into(),
            path,
        });
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Validates the request and turns it into an immutable spec
    pub fn into_spec(self, id: Uuid) -> Result<JobSpec, SpecError> {
        let entrypoint = Entrypoint::from_parts(self.command, self.program_path)?;

        Ok(JobSpec {
            id,
            language: self.language,
            language_version: self.language_version,
            entrypoint,
            requirements_path: self.requirements_path,
            deterministic_execution: self.deterministic_execution,
            job_context: self.job_context.map(Into::into),
            submitter: self.submitter,
            namespace: self.namespace,
        })
    }
}

impl From<&JobSpec> for SubmitJob {
    fn from(spec: &JobSpec) -> Self {
        Self {
            language: spec.language.clone(),
            language_version: spec.language_version.clone(),
            command: spec.entrypoint.command().map(str::to_string),
            program_path: spec.entrypoint.program_path().map(str::to_string),
            requirements_path: spec.requirements_path.clone(),
            deterministic_execution: spec.deterministic_execution,
            job_context: spec.job_context.clone().map(Into::into),
            submitter: spec.submitter.clone(),
            namespace: spec.namespace.clone(),
        }
    }
}

/// Response to a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubmitJobResponse {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub phase: JobPhase,
    pub submitted_at: DateTime<Utc>,
}

impl WireModel for SubmitJobResponse {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("job_id", "JobID"),
        ("phase", "Phase"),
        ("submitted_at", "SubmittedAt"),
    ];
}

impl From<&JobRecord> for SubmitJobResponse {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id(),
            phase: record.phase,
            submitted_at: record.submitted_at,
        }
    }
}

/// One entry of a job's history as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryItem {
    pub seq_num: u64,
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<JobPhase>,
    pub new: JobPhase,
    pub cause: String,
}

impl WireModel for HistoryItem {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("seq_num", "SeqNum"),
        ("job_id", "JobID"),
        ("time", "Time"),
        ("previous", "Previous"),
        ("new", "New"),
        ("cause", "Cause"),
    ];
}

impl HistoryItem {
    pub fn from_event(job_id: Uuid, event: &TransitionEvent) -> Self {
        Self {
            seq_num: event.seq,
            job_id,
            time: event.at,
            previous: event.from,
            new: event.to,
            cause: event.cause.to_string(),
        }
    }
}

/// Client-facing projection of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobView {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub phase: JobPhase,
    pub submitted_at: DateTime<Utc>,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    pub deterministic_execution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Last transition and its cause, so failures explain themselves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<HistoryItem>,
}

impl WireModel for JobView {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("job_id", "JobID"),
        ("phase", "Phase"),
        ("submitted_at", "SubmittedAt"),
        ("language", "Language"),
        ("language_version", "LanguageVersion"),
        ("deterministic_execution", "DeterministicExecution"),
        ("assigned_node", "AssignedNode"),
        ("submitter", "Submitter"),
        ("namespace", "Namespace"),
        ("last_event", "LastEvent"),
    ];
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        let job_id = record.id();

        Self {
            job_id,
            phase: record.phase,
            submitted_at: record.submitted_at,
            language: record.spec.language.clone(),
            language_version: record.spec.language_version.clone(),
            deterministic_execution: record.spec.deterministic_execution,
            assigned_node: record.assigned_node.clone(),
            submitter: record.spec.submitter.clone(),
            namespace: record.spec.namespace.clone(),
            last_event: record
                .last_event()
                .map(|event| HistoryItem::from_event(job_id, event)),
        }
    }
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        JobView::from(&record)
    }
}

/// Page of jobs returned by the list endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub jobs: Vec<JobView>,
    /// Continuation token; absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

impl WireModel for ListResponse {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] =
        &[("jobs", "jobs"), ("next_token", "next_token")];
}

/// Transition history of one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobHistory {
    pub items: Vec<HistoryItem>,
}

impl WireModel for JobHistory {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[("items", "Items")];
}

/// Response to a cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelJobResponse {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub phase: JobPhase,
}

impl WireModel for CancelJobResponse {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] =
        &[("job_id", "JobID"), ("phase", "Phase")];
}

/// Query parameters of the list endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<JobPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Only jobs submitted at or after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Only jobs submitted before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Query parameters of the history endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only events with a sequence number greater than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}
