//! Result reconciliation
//!
//! Collects per-node execution results and decides when a job is done.
//! Results are deduplicated per (job, node); the decision itself is a
//! pluggable policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_core::domain::job::ReassignReason;
use keel_core::domain::result::{ExecutionResult, ResultStatus, Verdict};
use keel_core::domain::{JobId, NodeId};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What the coordinator should do after a result was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A result from this node was already recorded; nothing changes
    Duplicate,
    /// Abandon the node and run the job elsewhere
    Reassign(ReassignReason),
    /// The job is decided
    Verdict(Verdict),
}

/// Results gathered for one job, as seen by a policy
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub results: BTreeMap<NodeId, ExecutionResult>,
    /// Failed or timed-out executions so far
    pub failures: u32,
    pub verdict: Option<Verdict>,
}

impl Ledger {
    /// Successful results that share `hash`
    pub fn agreeing(&self, hash: Option<&str>) -> usize {
        self.results
            .values()
            .filter(|r| r.is_success() && r.verification_hash.as_deref() == hash)
            .count()
    }
}

/// Decides the job-level outcome after each new result
pub trait ReconcilePolicy: Send + Sync {
    fn decide(&self, ledger: &Ledger, latest: &ExecutionResult, retry_budget: u32) -> Outcome;
}

/// First success completes the job
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleResult;

impl ReconcilePolicy for SingleResult {
    fn decide(&self, ledger: &Ledger, latest: &ExecutionResult, retry_budget: u32) -> Outcome {
        match latest.status {
            ResultStatus::Success => Outcome::Verdict(Verdict::Completed),
            status => on_failure(ledger, status, retry_budget),
        }
    }
}

/// Completes once `required` successes agree on the verification hash
#[derive(Debug, Clone, Copy)]
pub struct Quorum {
    pub required: u32,
}

impl ReconcilePolicy for Quorum {
    fn decide(&self, ledger: &Ledger, latest: &ExecutionResult, retry_budget: u32) -> Outcome {
        match latest.status {
            ResultStatus::Success => {
                let agreeing = ledger.agreeing(latest.verification_hash.as_deref());
                if agreeing >= self.required as usize {
                    Outcome::Verdict(Verdict::Completed)
                } else {
                    Outcome::Reassign(ReassignReason::QuorumPending)
                }
            }
            status => on_failure(ledger, status, retry_budget),
        }
    }
}

fn on_failure(ledger: &Ledger, status: ResultStatus, retry_budget: u32) -> Outcome {
    if ledger.failures > retry_budget {
        return Outcome::Verdict(Verdict::Failed);
    }
    match status {
        ResultStatus::Timeout => Outcome::Reassign(ReassignReason::ResultTimeout),
        _ => Outcome::Reassign(ReassignReason::ExecutionFailed),
    }
}

/// Builds the policy for a configured quorum size
pub fn policy_for_quorum(quorum: u32) -> Arc<dyn ReconcilePolicy> {
    if quorum <= 1 {
        Arc::new(SingleResult)
    } else {
        Arc::new(Quorum { required: quorum })
    }
}

pub struct ResultReconciler {
    policy: Arc<dyn ReconcilePolicy>,
    retry_budget: u32,
    ledgers: Mutex<HashMap<JobId, Ledger>>,
}

impl ResultReconciler {
    pub fn new(policy: Arc<dyn ReconcilePolicy>, retry_budget: u32) -> Self {
        Self {
            policy,
            retry_budget,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    /// Records one node's result and returns what to do next
    pub async fn record(&self, job_id: JobId, result: ExecutionResult) -> Outcome {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers.entry(job_id).or_default();

        if ledger.results.contains_key(&result.node_id) {
            debug!(
                "Job {}: duplicate result from node {} ignored",
                job_id, result.node_id
            );
            return Outcome::Duplicate;
        }
        if let Some(verdict) = ledger.verdict {
            return Outcome::Verdict(verdict);
        }

        if !result.is_success() {
            ledger.failures += 1;
        }
        ledger
            .results
            .insert(result.node_id.clone(), result.clone());

        let outcome = self.policy.decide(ledger, &result, self.retry_budget);
        if let Outcome::Verdict(verdict) = outcome {
            info!("Job {}: verdict {:?} after result from {}", job_id, verdict, result.node_id);
            ledger.verdict = Some(verdict);
        }

        outcome
    }

    pub async fn verdict(&self, job_id: JobId) -> Option<Verdict> {
        self.ledgers
            .lock()
            .await
            .get(&job_id)
            .and_then(|ledger| ledger.verdict)
    }

    /// Copy of the results gathered for a job
    pub async fn results(&self, job_id: JobId) -> BTreeMap<NodeId, ExecutionResult> {
        self.ledgers
            .lock()
            .await
            .get(&job_id)
            .map(|ledger| ledger.results.clone())
            .unwrap_or_default()
    }

    /// Seeds a job's ledger from results already persisted in its record
    pub async fn restore(&self, job_id: JobId, results: &BTreeMap<NodeId, ExecutionResult>) {
        if results.is_empty() {
            return;
        }

        let ledger = Ledger {
            results: results.clone(),
            failures: results.values().filter(|r| !r.is_success()).count() as u32,
            verdict: None,
        };
        self.ledgers.lock().await.insert(job_id, ledger);
    }

    /// Drops the working state of a finished job
    pub async fn forget(&self, job_id: JobId) {
        self.ledgers.lock().await.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn result(job_id: JobId, node: &str, status: ResultStatus, hash: Option<&str>) -> ExecutionResult {
        ExecutionResult {
            job_id,
            node_id: node.to_string(),
            status,
            payload_ref: None,
            verification_hash: hash.map(str::to_string),
            message: None,
            reported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_success_completes() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 1);
        let job = Uuid::new_v4();

        let outcome = reconciler
            .record(job, result(job, "a", ResultStatus::Success, Some("h")))
            .await;

        assert_eq!(outcome, Outcome::Verdict(Verdict::Completed));
        assert_eq!(reconciler.verdict(job).await, Some(Verdict::Completed));
    }

    #[tokio::test]
    async fn test_duplicate_result_is_ignored() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 0);
        let job = Uuid::new_v4();
        let failure = result(job, "a", ResultStatus::Failure, None);

        let first = reconciler.record(job, failure.clone()).await;
        let second = reconciler.record(job, failure).await;

        assert_eq!(first, Outcome::Verdict(Verdict::Failed));
        assert_eq!(second, Outcome::Duplicate);
        assert_eq!(reconciler.verdict(job).await, Some(Verdict::Failed));
        assert_eq!(reconciler.results(job).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_consume_retry_budget() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 1);
        let job = Uuid::new_v4();

        assert_eq!(
            reconciler
                .record(job, result(job, "a", ResultStatus::Failure, None))
                .await,
            Outcome::Reassign(ReassignReason::ExecutionFailed)
        );
        assert_eq!(
            reconciler
                .record(job, result(job, "b", ResultStatus::Timeout, None))
                .await,
            Outcome::Verdict(Verdict::Failed)
        );
    }

    #[tokio::test]
    async fn test_timeout_reassigns_while_budget_remains() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 2);
        let job = Uuid::new_v4();

        let outcome = reconciler
            .record(job, ExecutionResult::timed_out(job, "a".into(), Utc::now()))
            .await;
        assert_eq!(outcome, Outcome::Reassign(ReassignReason::ResultTimeout));
        assert_eq!(reconciler.verdict(job).await, None);
    }

    #[tokio::test]
    async fn test_quorum_requires_agreeing_hashes() {
        let reconciler = ResultReconciler::new(Arc::new(Quorum { required: 2 }), 1);
        let job = Uuid::new_v4();

        let outcomes = [
            reconciler
                .record(job, result(job, "a", ResultStatus::Success, Some("x")))
                .await,
            reconciler
                .record(job, result(job, "b", ResultStatus::Success, Some("y")))
                .await,
            reconciler
                .record(job, result(job, "c", ResultStatus::Success, Some("x")))
                .await,
        ];

        assert_eq!(
            outcomes,
            [
                Outcome::Reassign(ReassignReason::QuorumPending),
                Outcome::Reassign(ReassignReason::QuorumPending),
                Outcome::Verdict(Verdict::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_results_after_verdict_do_not_change_it() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 0);
        let job = Uuid::new_v4();

        reconciler
            .record(job, result(job, "a", ResultStatus::Success, None))
            .await;
        let late = reconciler
            .record(job, result(job, "b", ResultStatus::Failure, None))
            .await;

        assert_eq!(late, Outcome::Verdict(Verdict::Completed));
        reconciler.forget(job).await;
        assert_eq!(reconciler.verdict(job).await, None);
    }

    #[tokio::test]
    async fn test_restore_counts_persisted_failures() {
        let reconciler = ResultReconciler::new(Arc::new(SingleResult), 1);
        let job = Uuid::new_v4();
        let persisted = BTreeMap::from([(
            "a".to_string(),
            result(job, "a", ResultStatus::Failure, None),
        )]);

        reconciler.restore(job, &persisted).await;

        assert_eq!(
            reconciler
                .record(job, result(job, "a", ResultStatus::Success, None))
                .await,
            Outcome::Duplicate
        );
        assert_eq!(
            reconciler
                .record(job, result(job, "b", ResultStatus::Failure, None))
                .await,
            Outcome::Verdict(Verdict::Failed)
        );
    }

    #[test]
    fn test_policy_for_quorum() {
        let job = Uuid::new_v4();
        let ledger = Ledger::default();
        let success = result(job, "a", ResultStatus::Success, None);

        // A single success is not enough when two are required
        let mut seen = ledger.clone();
        seen.results.insert("a".into(), success.clone());
        assert_eq!(
            policy_for_quorum(2).decide(&seen, &success, 0),
            Outcome::Reassign(ReassignReason::QuorumPending)
        );
        assert_eq!(
            policy_for_quorum(1).decide(&seen, &success, 0),
            Outcome::Verdict(Verdict::Completed)
        );
    }
}
