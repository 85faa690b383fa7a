//! Raft cluster and timing configuration

use std::time::Duration;

use thiserror::Error;

use super::message::NodeId;

/// Errors raised when a configuration cannot describe a working cluster
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Cluster size must be odd and at least 3
    #[error("cluster size must be an odd number >= 3, got {0}")]
    InvalidClusterSize(usize),
    /// Node id outside `[0, cluster_size)`
    #[error("node id {id} is outside a cluster of {cluster_size} nodes")]
    InvalidNodeId { id: NodeId, cluster_size: usize },
    /// A timer duration was zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Configuration for a fixed-size Raft cluster
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Number of nodes in the cluster (default: 5)
    pub cluster_size: usize,
    /// Fixed part of the election timeout (default: 3s)
    pub election_timeout: Duration,
    /// Upper bound of the random extra added to each election timeout (default: 500ms)
    pub election_timeout_spread: Duration,
    /// Interval between leader heartbeats (default: 1s)
    pub heartbeat_interval: Duration,
    /// Deny votes to candidates whose log is behind ours (default: false).
    /// Off reproduces the plain vote rule, which lacks Raft's election restriction.
    pub check_candidate_log: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            cluster_size: 5,
            election_timeout: Duration::from_secs(3),
            election_timeout_spread: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(1),
            check_candidate_log: false,
        }
    }
}

impl RaftConfig {
    /// Create a new config with a custom cluster size
    pub fn with_cluster_size(mut self, cluster_size: usize) -> Self {
        self.cluster_size = cluster_size;
        self
    }

    /// Create a new config with a custom election timeout and random spread
    pub fn with_election_timeout(mut self, timeout: Duration, spread: Duration) -> Self {
        self.election_timeout = timeout;
        self.election_timeout_spread = spread;
        self
    }

    /// Create a new config with a custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enable or disable the candidate log check when granting votes
    pub fn with_candidate_log_check(mut self, enabled: bool) -> Self {
        self.check_candidate_log = enabled;
        self
    }

    /// Check that the configuration describes a usable cluster
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_size < 3 || self.cluster_size % 2 == 0 {
            return Err(ConfigError::InvalidClusterSize(self.cluster_size));
        }
        if self.election_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("election timeout"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }
        Ok(())
    }

    /// Check that `id` names a node of this cluster
    pub fn validate_node(&self, id: NodeId) -> Result<(), ConfigError> {
        self.validate()?;
        if id >= self.cluster_size {
            return Err(ConfigError::InvalidNodeId {
                id,
                cluster_size: self.cluster_size,
            });
        }
        Ok(())
    }

    /// Minimum number of nodes (including self) that form a majority
    pub fn quorum(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Generate a randomized election timeout: fixed part plus uniform spread
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let spread_ms = self.election_timeout_spread.as_millis() as u64;
        let extra_ms = if spread_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread_ms)
        };
        self.election_timeout + Duration::from_millis(extra_ms)
    }
}
