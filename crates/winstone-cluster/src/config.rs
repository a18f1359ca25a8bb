//! Cluster configuration.

use std::time::Duration;

/// Default interval between heartbeat rounds.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Settings for a [`SimpleCluster`](crate::SimpleCluster).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Address peers use to reach this node's control port.
    pub control_address: String,

    /// This node's control port. Sent with every request so peers can
    /// record where to reach us.
    pub control_port: u16,

    /// Seed peers as `ip:port`.
    pub nodes: Vec<String>,

    /// Interval between heartbeat rounds. A peer not heard from for three
    /// periods is evicted.
    pub heartbeat_period: Duration,

    /// Timeout for connecting to and reading from a single peer.
    pub connect_timeout: Duration,

    /// Upper bound on a cluster-wide session search.
    pub search_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(control_address: impl Into<String>, control_port: u16) -> Self {
        Self {
            control_address: control_address.into(),
            control_port,
            nodes: Vec::new(),
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            connect_timeout: Duration::from_secs(2),
            search_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the seed peers from a comma-separated list.
    pub fn with_nodes(mut self, nodes: &str) -> Self {
        self.nodes = parse_node_list(nodes);
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    /// This node as peers see it.
    pub fn own_address(&self) -> String {
        format!("{}:{}", self.control_address, self.control_port)
    }

    /// Age after which a silent peer is evicted.
    pub fn eviction_age(&self) -> Duration {
        self.heartbeat_period * 3
    }
}

/// Splits a comma-separated peer list, dropping blanks.
pub fn parse_node_list(nodes: &str) -> Vec<String> {
    nodes
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(str::to_owned)
        .collect()
}
