//! Orchestrator configuration
//!
//! Defines the timeouts, retry bounds and paging limits the scheduling
//! components run with. One value is built at start-up and handed to each
//! component when it is constructed.

use std::time::Duration;

/// Orchestrator configuration
///
/// Every timeout and bound is configurable so deployments can trade
/// responsiveness against tolerance for slow nodes.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a job stays in bidding waiting for offers
    pub bidding_window: Duration,

    /// How long the assigned node has to acknowledge the start of execution
    pub ack_timeout: Duration,

    /// How long a running job may go without reporting a result
    pub result_timeout: Duration,

    /// Matching attempts before a job fails with no eligible nodes
    pub match_retry_ceiling: u32,

    /// First delay between matching attempts; doubles on every retry
    pub match_backoff_initial: Duration,

    /// Upper bound for the matching backoff delay
    pub match_backoff_max: Duration,

    /// Times a job may go back to bidding after abandoning a node
    pub max_reassignments: u32,

    /// Failed or timed-out executions tolerated before the job fails
    pub result_retry_budget: u32,

    /// Agreeing successful results required to complete a job
    pub quorum: u32,

    /// Page size used when a list request does not set one
    pub default_page_size: usize,

    /// Largest page size a list request may ask for
    pub max_page_size: usize,

    /// Nodes that have not advertised for this long are dropped from the feed
    pub node_ttl: Duration,

    /// Upper bound on one outbound call to a node (bid request, assignment, cancel)
    pub node_request_timeout: Duration,

    /// Address the HTTP API binds to
    pub bind_addr: String,

    /// Postgres connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
}

impl OrchestratorConfig {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            bidding_window: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            result_timeout: Duration::from_secs(600), // 10 minutes
            match_retry_ceiling: 3,
            match_backoff_initial: Duration::from_millis(500),
            match_backoff_max: Duration::from_secs(10),
            max_reassignments: 3,
            result_retry_budget: 1,
            quorum: 1,
            default_page_size: 100,
            max_page_size: 1000,
            node_ttl: Duration::from_secs(60),
            node_request_timeout: Duration::from_secs(5),
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognised environment variables (all optional):
    /// - KEEL_BIDDING_WINDOW_MS (default: 10000)
    /// - KEEL_ACK_TIMEOUT_MS (default: 30000)
    /// - KEEL_RESULT_TIMEOUT_MS (default: 600000)
    /// - KEEL_MATCH_RETRY_CEILING (default: 3)
    /// - KEEL_MATCH_BACKOFF_INITIAL_MS (default: 500)
    /// - KEEL_MATCH_BACKOFF_MAX_MS (default: 10000)
    /// - KEEL_MAX_REASSIGNMENTS (default: 3)
    /// - KEEL_RESULT_RETRY_BUDGET (default: 1)
    /// - KEEL_QUORUM (default: 1)
    /// - KEEL_DEFAULT_PAGE_SIZE (default: 100)
    /// - KEEL_MAX_PAGE_SIZE (default: 1000)
    /// - KEEL_NODE_TTL_MS (default: 60000)
    /// - KEEL_NODE_REQUEST_TIMEOUT_MS (default: 5000)
    /// - ORCHESTRATOR_BIND_ADDR (default: 0.0.0.0:8080)
    /// - DATABASE_URL (default: unset, in-memory store)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::new();

        let config = Self {
            bidding_window: env_millis("KEEL_BIDDING_WINDOW_MS")?
                .unwrap_or(defaults.bidding_window),
            ack_timeout: env_millis("KEEL_ACK_TIMEOUT_MS")?.unwrap_or(defaults.ack_timeout),
            result_timeout: env_millis("KEEL_RESULT_TIMEOUT_MS")?
                .unwrap_or(defaults.result_timeout),
            match_retry_ceiling: env_parse("KEEL_MATCH_RETRY_CEILING")?
                .unwrap_or(defaults.match_retry_ceiling),
            match_backoff_initial: env_millis("KEEL_MATCH_BACKOFF_INITIAL_MS")?
                .unwrap_or(defaults.match_backoff_initial),
            match_backoff_max: env_millis("KEEL_MATCH_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.match_backoff_max),
            max_reassignments: env_parse("KEEL_MAX_REASSIGNMENTS")?
                .unwrap_or(defaults.max_reassignments),
            result_retry_budget: env_parse("KEEL_RESULT_RETRY_BUDGET")?
                .unwrap_or(defaults.result_retry_budget),
            quorum: env_parse("KEEL_QUORUM")?.unwrap_or(defaults.quorum),
            default_page_size: env_parse("KEEL_DEFAULT_PAGE_SIZE")?
                .unwrap_or(defaults.default_page_size),
            max_page_size: env_parse("KEEL_MAX_PAGE_SIZE")?.unwrap_or(defaults.max_page_size),
            node_ttl: env_millis("KEEL_NODE_TTL_MS")?.unwrap_or(defaults.node_ttl),
            node_request_timeout: env_millis("KEEL_NODE_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.node_request_timeout),
            bind_addr: std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_bidding_window(mut self, window: Duration) -> Self {
        self.bidding_window = window;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn with_match_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.match_retry_ceiling = ceiling;
        self
    }

    pub fn with_match_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.match_backoff_initial = initial;
        self.match_backoff_max = max;
        self
    }

    pub fn with_max_reassignments(mut self, max: u32) -> Self {
        self.max_reassignments = max;
        self
    }

    pub fn with_result_retry_budget(mut self, budget: u32) -> Self {
        self.result_retry_budget = budget;
        self
    }

    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_page_sizes(mut self, default: usize, max: usize) -> Self {
        self.default_page_size = default;
        self.max_page_size = max;
        self
    }

    pub fn with_node_ttl(mut self, ttl: Duration) -> Self {
        self.node_ttl = ttl;
        self
    }

    pub fn with_node_request_timeout(mut self, timeout: Duration) -> Self {
        self.node_request_timeout = timeout;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Clamps a requested page size into `1..=max_page_size`
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bidding_window.is_zero() {
            anyhow::bail!("bidding_window must be greater than 0");
        }

        if self.ack_timeout.is_zero() {
            anyhow::bail!("ack_timeout must be greater than 0");
        }

        if self.result_timeout.is_zero() {
            anyhow::bail!("result_timeout must be greater than 0");
        }

        if self.match_retry_ceiling == 0 {
            anyhow::bail!("match_retry_ceiling must be at least 1");
        }

        if self.match_backoff_initial > self.match_backoff_max {
            anyhow::bail!("match_backoff_initial cannot exceed match_backoff_max");
        }

        if self.quorum == 0 {
            anyhow::bail!("quorum must be at least 1");
        }

        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            anyhow::bail!("default_page_size must be between 1 and max_page_size");
        }

        if self.node_ttl.is_zero() {
            anyhow::bail!("node_ttl must be greater than 0");
        }

        if self.node_request_timeout.is_zero() {
            anyhow::bail!("node_request_timeout must be greater than 0");
        }

        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.bidding_window, Duration::from_secs(10));
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
        assert_eq!(config.match_retry_ceiling, 3);
        assert_eq!(config.quorum, 1);
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());

        config.quorum = 0;
        assert!(config.validate().is_err());
        config.quorum = 2;

        config.bidding_window = Duration::ZERO;
        assert!(config.validate().is_err());
        config.bidding_window = Duration::from_secs(1);

        config.match_backoff_initial = Duration::from_secs(60);
        assert!(config.validate().is_err());
        config.match_backoff_initial = Duration::from_millis(100);

        config.default_page_size = config.max_page_size + 1;
        assert!(config.validate().is_err());
        config.default_page_size = 10;

        config.node_request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = OrchestratorConfig::new()
            .with_bidding_window(Duration::from_millis(250))
            .with_match_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .with_quorum(3)
            .with_database_url("postgres://keel@localhost/keel");

        assert_eq!(config.bidding_window, Duration::from_millis(250));
        assert_eq!(config.match_backoff_max, Duration::from_millis(40));
        assert_eq!(config.quorum, 3);
        assert!(config.database_url.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let config = OrchestratorConfig::new().with_page_sizes(20, 50);
        assert_eq!(config.page_size(None), 20);
        assert_eq!(config.page_size(Some(0)), 1);
        assert_eq!(config.page_size(Some(500)), 50);
    }
}
