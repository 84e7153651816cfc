//! Node capability domain types
//!
//! Capabilities are advertised by executor nodes and consumed read-only by
//! the matcher. The latest advertisement for a node replaces earlier ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;

/// A language runtime a node can execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSupport {
    pub language: String,
    /// Installed versions; empty means the node only accepts unpinned jobs
    pub versions: Vec<String>,
}

/// Point-in-time description of what a node can execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapability {
    pub node_id: NodeId,
    pub languages: Vec<LanguageSupport>,
    pub total_capacity: u32,
    pub available_capacity: u32,
    /// Jobs currently executing on the node
    pub current_load: u32,
    /// Whether the node can run sandboxed, reproducible executions
    pub deterministic: bool,
    /// Base URL the orchestrator uses to reach the node
    pub endpoint: Option<String>,
    pub advertised_at: DateTime<Utc>,
}

impl NodeCapability {
    /// Whether the node runs `language`, and `version` when one is pinned.
    ///
    /// Language names compare case-insensitively, versions exactly.
    pub fn supports(&self, language: &str, version: Option<&str>) -> bool {
        self.languages.iter().any(|support| {
            support.language.eq_ignore_ascii_case(language)
                && version.is_none_or(|v| support.versions.iter().any(|known| known == v))
        })
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|support| support.language.eq_ignore_ascii_case(language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeCapability {
        NodeCapability {
            node_id: "node-a".to_string(),
            languages: vec![LanguageSupport {
                language: "Python".to_string(),
                versions: vec!["3.10".to_string(), "3.11".to_string()],
            }],
            total_capacity: 4,
            available_capacity: 4,
            current_load: 0,
            deterministic: true,
            endpoint: None,
            advertised_at: Utc::now(),
        }
    }

    #[test]
    fn test_supports_language_case_insensitively() {
        let node = node();
        assert!(node.supports("python", None));
        assert!(node.supports("PYTHON", Some("3.11")));
        assert!(!node.supports("wasm", None));
    }

    #[test]
    fn test_supports_pinned_version_exactly() {
        let node = node();
        assert!(node.supports("python", Some("3.10")));
        assert!(!node.supports("python", Some("3.9")));
        assert!(node.supports_language("python"));
    }
}
