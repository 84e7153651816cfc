//! Service Module
//!
//! Scheduling logic for the orchestrator: matching, lifecycle coordination,
//! result reconciliation, read-only queries, and the node-facing feed and
//! transport they depend on.

pub mod feed;
pub mod lifecycle;
pub mod matcher;
pub mod query;
pub mod reconciler;
pub mod transport;

// Re-export for convenience
pub use feed::{CapabilityFeed, InMemoryCapabilityFeed};
pub use lifecycle::{CoordinatorBuilder, LifecycleCoordinator};
pub use matcher::Matcher;
pub use query::QueryService;
pub use reconciler::ResultReconciler;
pub use transport::{HttpNodeTransport, LoggingTransport, NodeTransport};
