//! Node DTOs
//!
//! Messages nodes send to the orchestrator (advertisements, bids,
//! acknowledgements, results) and messages the orchestrator sends to nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::bid::{Bid, BidTerms};
use crate::domain::job::JobSpec;
use crate::domain::node::{LanguageSupport, NodeCapability};
use crate::domain::result::{ExecutionResult, ResultStatus};
use crate::domain::NodeId;
use crate::dto::job::SubmitJob;
use crate::dto::WireModel;

/// One language runtime in an advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LanguageEntry {
    pub language: String,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl WireModel for LanguageEntry {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] =
        &[("language", "Language"), ("versions", "Versions")];
}

/// Capability advertisement sent by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdvertiseNode {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    pub languages: Vec<LanguageEntry>,
    pub total_capacity: u32,
    pub available_capacity: u32,
    #[serde(default)]
    pub current_load: u32,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl WireModel for AdvertiseNode {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("node_id", "NodeID"),
        ("languages", "Languages"),
        ("total_capacity", "TotalCapacity"),
        ("available_capacity", "AvailableCapacity"),
        ("current_load", "CurrentLoad"),
        ("deterministic", "Deterministic"),
        ("endpoint", "Endpoint"),
    ];
}

impl AdvertiseNode {
    pub fn new(node_id: impl Into<NodeId>, capacity: u32) -> Self {
        Self {
            node_id: node_id.into(),
            languages: Vec::new(),
            total_capacity: capacity,
            available_capacity: capacity,
            current_load: 0,
            deterministic: false,
            endpoint: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>, versions: &[&str]) -> Self {
        self.languages.push(LanguageEntry {
            language: language.into(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn into_capability(self, now: DateTime<Utc>) -> NodeCapability {
        NodeCapability {
            node_id: self.node_id,
            languages: self
                .languages
                .into_iter()
                .map(|entry| LanguageSupport {
                    language: entry.language,
                    versions: entry.versions,
                })
                .collect(),
            total_capacity: self.total_capacity,
            available_capacity: self.available_capacity,
            current_load: self.current_load,
            deterministic: self.deterministic,
            endpoint: self.endpoint,
            advertised_at: now,
        }
    }
}

/// Bid submitted by a node for a job in bidding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaceBid {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(default)]
    pub cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl WireModel for PlaceBid {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("node_id", "NodeID"),
        ("cost", "Cost"),
        ("note", "Note"),
        ("expires_at", "ExpiresAt"),
    ];
}

impl PlaceBid {
    pub fn into_bid(self, job_id: Uuid) -> Bid {
        Bid {
            job_id,
            node_id: self.node_id,
            terms: BidTerms {
                cost: self.cost,
                note: self.note,
            },
            expires_at: self.expires_at,
        }
    }
}

/// Start-of-execution acknowledgement from the assigned node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Acknowledge {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
}

impl WireModel for Acknowledge {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[("node_id", "NodeID")];
}

/// Execution result reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportResult {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WireModel for ReportResult {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("node_id", "NodeID"),
        ("status", "Status"),
        ("payload_ref", "PayloadRef"),
        ("verification_hash", "VerificationHash"),
        ("message", "Message"),
    ];
}

impl ReportResult {
    pub fn success(node_id: impl Into<NodeId>, verification_hash: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: ResultStatus::Success,
            payload_ref: None,
            verification_hash: Some(verification_hash.into()),
            message: None,
        }
    }

    pub fn failure(node_id: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: ResultStatus::Failure,
            payload_ref: None,
            verification_hash: None,
            message: Some(message.into()),
        }
    }

    pub fn into_result(self, job_id: Uuid, now: DateTime<Utc>) -> ExecutionResult {
        ExecutionResult {
            job_id,
            node_id: self.node_id,
            status: self.status,
            payload_ref: self.payload_ref,
            verification_hash: self.verification_hash,
            message: self.message,
            reported_at: now,
        }
    }
}

// ============================================================================
// Orchestrator -> node messages
// ============================================================================

/// Invitation to bid, sent to every matched node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BidRequest {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    pub deterministic_execution: bool,
    /// Bids arriving after this instant are discarded
    pub bid_deadline: DateTime<Utc>,
}

impl WireModel for BidRequest {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[
        ("job_id", "JobID"),
        ("language", "Language"),
        ("language_version", "LanguageVersion"),
        ("deterministic_execution", "DeterministicExecution"),
        ("bid_deadline", "BidDeadline"),
    ];
}

impl BidRequest {
    pub fn for_spec(spec: &JobSpec, bid_deadline: DateTime<Utc>) -> Self {
        Self {
            job_id: spec.id,
            language: spec.language.clone(),
            language_version: spec.language_version.clone(),
            deterministic_execution: spec.deterministic_execution,
            bid_deadline,
        }
    }
}

/// Assignment handed to the winning node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssignJob {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
    pub job: SubmitJob,
}

impl WireModel for AssignJob {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] =
        &[("job_id", "JobID"), ("job", "Job")];
}

impl From<&JobSpec> for AssignJob {
    fn from(spec: &JobSpec) -> Self {
        Self {
            job_id: spec.id,
            job: SubmitJob::from(spec),
        }
    }
}

/// Tells a node to stop executing a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelExecution {
    #[serde(rename = "JobID")]
    pub job_id: Uuid,
}

impl WireModel for CancelExecution {
    const WIRE_KEYS: &'static [(&'static str, &'static str)] = &[("job_id", "JobID")];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::testing::assert_wire_keys;

    #[test]
    fn test_advertisement_into_capability() {
        let now = Utc::now();
        let capability = AdvertiseNode::new("node-a", 8)
            .with_language("python", &["3.10", "3.11"])
            .deterministic(true)
            .with_endpoint("http://node-a:9000")
            .into_capability(now);

        assert_eq!(capability.node_id, "node-a");
        assert_eq!(capability.available_capacity, 8);
        assert!(capability.supports("python", Some("3.11")));
        assert_eq!(capability.advertised_at, now);
        assert_eq!(capability.endpoint.as_deref(), Some("http://node-a:9000"));
    }

    #[test]
    fn test_advertisement_accepts_minimal_json() {
        let advert: AdvertiseNode = serde_json::from_value(serde_json::json!({
            "NodeID": "node-b",
            "Languages": [{ "Language": "python" }],
            "TotalCapacity": 2,
            "AvailableCapacity": 1
        }))
        .unwrap();

        assert_eq!(advert.current_load, 0);
        assert!(!advert.deterministic);
        assert!(advert.languages[0].versions.is_empty());
    }

    #[test]
    fn test_advertisement_wire_keys() {
        let advert = AdvertiseNode::new("node-a", 4)
            .with_language("python", &["3.11"])
            .with_endpoint("http://node-a:9000");
        assert_wire_keys(&advert);
        assert_wire_keys(&advert.languages[0]);
    }

    #[test]
    fn test_bid_conversion() {
        let job_id = Uuid::new_v4();
        let expires_at = Utc::now();
        let bid = PlaceBid {
            node_id: "node-a".into(),
            cost: 12,
            note: Some("spot".into()),
            expires_at,
        };
        assert_wire_keys(&bid);

        let bid = bid.into_bid(job_id);
        assert_eq!(bid.job_id, job_id);
        assert_eq!(bid.terms.cost, 12);
        assert_eq!(bid.expires_at, expires_at);
    }

    #[test]
    fn test_result_conversion() {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let mut report = ReportResult::success("node-a", "sha256:abc");
        report.payload_ref = Some("ipfs://out".into());
        report.message = Some("ok".into());
        assert_wire_keys(&report);

        let result = report.into_result(job_id, now);
        assert!(result.is_success());
        assert_eq!(result.verification_hash.as_deref(), Some("sha256:abc"));
        assert_eq!(result.reported_at, now);

        let failure = ReportResult::failure("node-a", "oom").into_result(job_id, now);
        assert_eq!(failure.status, ResultStatus::Failure);
    }

    #[test]
    fn test_status_wire_form() {
        let wire = ReportResult::failure("node-a", "boom").to_wire().unwrap();
        assert_eq!(wire["Status"], serde_json::json!("Failure"));
        assert!(!wire.contains_key("VerificationHash"));
    }

    #[test]
    fn test_outbound_messages_wire_keys() {
        let spec = SubmitJob::program("python", "run.py")
            .with_version("3.11")
            .into_spec(Uuid::new_v4())
            .unwrap();

        assert_wire_keys(&BidRequest::for_spec(&spec, Utc::now()));
        assert_wire_keys(&AssignJob::from(&spec));
        assert_wire_keys(&CancelExecution { job_id: spec.id });
        assert_wire_keys(&Acknowledge {
            node_id: "node-a".into(),
        });
    }
}
