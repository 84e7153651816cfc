//! Capability feed
//!
//! Holds the latest advertisement per node and publishes immutable
//! snapshots to the matcher. Readers never block writers: each update
//! builds a new snapshot and swaps it into a `watch` channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::domain::NodeId;
use keel_core::domain::node::NodeCapability;
use tokio::sync::watch;
use tracing::info;

/// Shared, read-only view of every known node
pub type CapabilitySnapshot = Arc<BTreeMap<NodeId, NodeCapability>>;

/// Source of node capability snapshots
pub trait CapabilityFeed: Send + Sync {
    /// Latest snapshot, keyed by node id
    fn snapshot(&self) -> CapabilitySnapshot;

    /// Receiver that observes every published snapshot
    fn subscribe(&self) -> watch::Receiver<CapabilitySnapshot>;
}

/// Feed backed by node advertisements received over the API
pub struct InMemoryCapabilityFeed {
    tx: watch::Sender<CapabilitySnapshot>,
}

impl Default for InMemoryCapabilityFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCapabilityFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(BTreeMap::new()));
        Self { tx }
    }

    /// Records a node's advertisement, replacing any earlier one
    pub fn advertise(&self, capability: NodeCapability) {
        let node_id = capability.node_id.clone();
        let mut replaced = false;

        self.tx.send_modify(|snapshot| {
            let mut next = BTreeMap::clone(snapshot);
            replaced = next.insert(capability.node_id.clone(), capability).is_some();
            *snapshot = Arc::new(next);
        });

        if replaced {
            tracing::debug!("Node {} refreshed its capabilities", node_id);
        } else {
            info!("Node {} joined the capability feed", node_id);
        }
    }

    /// Drops nodes whose last advertisement is older than `cutoff`
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Vec<NodeId> {
        let mut pruned = Vec::new();

        self.tx.send_if_modified(|snapshot| {
            pruned = snapshot
                .values()
                .filter(|node| node.advertised_at < cutoff)
                .map(|node| node.node_id.clone())
                .collect();
            if pruned.is_empty() {
                return false;
            }

            let next = snapshot
                .iter()
                .filter(|(_, node)| node.advertised_at >= cutoff)
                .map(|(id, node)| (id.clone(), node.clone()))
                .collect();
            *snapshot = Arc::new(next);
            true
        });

        if !pruned.is_empty() {
            info!("Pruned {} stale node(s): {:?}", pruned.len(), pruned);
        }
        pruned
    }
}

impl CapabilityFeed for InMemoryCapabilityFeed {
    fn snapshot(&self) -> CapabilitySnapshot {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<CapabilitySnapshot> {
        self.tx.subscribe()
    }
}
