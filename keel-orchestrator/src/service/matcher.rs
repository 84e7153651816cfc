//! Node matching
//!
//! Filters a capability snapshot down to the nodes able to run a job and
//! ranks them. Pure and deterministic: the same spec, snapshot and exclusion
//! set always yield the same ordered list.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use keel_core::domain::NodeId;
use keel_core::domain::job::JobSpec;
use keel_core::domain::node::NodeCapability;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Why a node was filtered out for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Language,
    Version,
    Determinism,
    NoCapacity,
    Excluded,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Language => write!(f, "language not supported"),
            Rejection::Version => write!(f, "language version not installed"),
            Rejection::Determinism => write!(f, "deterministic execution not supported"),
            Rejection::NoCapacity => write!(f, "no available capacity"),
            Rejection::Excluded => write!(f, "excluded for this job"),
        }
    }
}

/// Outcome of evaluating every node in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    /// Eligible nodes, best first
    pub matched: Vec<NodeId>,
    pub rejected: BTreeMap<NodeId, Rejection>,
}

/// Orders eligible nodes; earlier is preferred
pub trait NodeRanker: Send + Sync {
    fn compare(&self, a: &NodeCapability, b: &NodeCapability) -> Ordering;
}

/// Most available capacity first, then lowest load, then node id
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityRanker;

impl NodeRanker for CapacityRanker {
    fn compare(&self, a: &NodeCapability, b: &NodeCapability) -> Ordering {
        b.available_capacity
            .cmp(&a.available_capacity)
            .then(a.current_load.cmp(&b.current_load))
            .then_with(|| a.node_id.cmp(&b.node_id))
    }
}

#[derive(Clone)]
pub struct Matcher {
    ranker: Arc<dyn NodeRanker>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Arc::new(CapacityRanker))
    }
}

impl Matcher {
    pub fn new(ranker: Arc<dyn NodeRanker>) -> Self {
        Self { ranker }
    }

    /// Evaluates every node, keeping rejection reasons
    pub fn evaluate(
        &self,
        spec: &JobSpec,
        snapshot: &BTreeMap<NodeId, NodeCapability>,
        excluded: &BTreeSet<NodeId>,
    ) -> MatchReport {
        let mut report = MatchReport::default();
        let mut eligible = Vec::new();

        for node in snapshot.values() {
            match check(spec, node, excluded) {
                Ok(()) => eligible.push(node),
                Err(reason) => {
                    report.rejected.insert(node.node_id.clone(), reason);
                }
            }
        }

        eligible.sort_by(|a, b| {
            self.ranker
                .compare(a, b)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        report.matched = eligible.into_iter().map(|n| n.node_id.clone()).collect();

        report
    }

    /// Eligible node ids, best first, or `NoEligibleNodes`
    pub fn match_nodes(
        &self,
        spec: &JobSpec,
        snapshot: &BTreeMap<NodeId, NodeCapability>,
        excluded: &BTreeSet<NodeId>,
    ) -> Result<Vec<NodeId>> {
        let report = self.evaluate(spec, snapshot, excluded);

        for (node_id, reason) in &report.rejected {
            debug!("Job {}: node {} rejected ({})", spec.id, node_id, reason);
        }

        if report.matched.is_empty() {
            return Err(SchedulerError::NoEligibleNodes(spec.id));
        }

        Ok(report.matched)
    }
}

fn check(
    spec: &JobSpec,
    node: &NodeCapability,
    excluded: &BTreeSet<NodeId>,
) -> std::result::Result<(), Rejection> {
    if excluded.contains(&node.node_id) {
        return Err(Rejection::Excluded);
    }
    if !node.supports_language(&spec.language) {
        return Err(Rejection::Language);
    }
    if !node.supports(&spec.language, spec.language_version.as_deref()) {
        return Err(Rejection::Version);
    }
    if spec.deterministic_execution && !node.deterministic {
        return Err(Rejection::Determinism);
    }
    if node.available_capacity == 0 {
        return Err(Rejection::NoCapacity);
    }
    Ok(())
}
