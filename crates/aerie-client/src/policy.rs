//! Client and per-operation policies
//!
//! # Example
//!
//! ```rust
//! use aerie_client::{ClientPolicy, Replica};
//! use std::time::Duration;
//!
//! let policy = ClientPolicy::builder()
//!     .cluster_name("prod")
//!     .connection_queue_size(64)
//!     .min_connections_per_node(4)
//!     .rack_ids(vec![2, 1])
//!     .tend_interval(Duration::from_millis(500))
//!     .build();
//!
//! assert!(policy.rack_aware);
//! assert!(policy.validate().is_ok());
//! ```

use crate::auth::Credentials;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Replica selection
// ============================================================================

/// Which replica of a partition serves a command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replica {
    /// Master first, then the next replica on each retry
    #[default]
    Sequence,
    /// A replica on one of the client's racks, then the sequence chain
    PreferRack,
    /// Master only
    Master,
    /// Round-robin over master and prole replicas (reads only)
    MasterProles,
    /// Any node in the cluster (reads only)
    Random,
}

/// Read consistency for strong-consistency namespaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadModeSC {
    /// Monotonic reads within the client session, served by the master
    #[default]
    Session,
    /// Linearizable reads
    Linearize,
    /// Any replica may serve the read
    AllowReplica,
    /// Any replica, including unavailable partitions
    AllowUnavailable,
}

// ============================================================================
// Client Policy
// ============================================================================

/// Cluster-wide client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    /// User for clusters with security enabled
    pub user: Option<String>,
    /// Password, never serialized
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Expected cluster name, checked against every node
    pub cluster_name: Option<String>,
    /// Connect, login and info request timeout
    pub timeout: Duration,
    /// Pooled connections unused for this long are closed
    pub idle_timeout: Duration,
    /// Interval between cluster tend passes
    pub tend_interval: Duration,
    /// Connections kept open per node
    pub min_connections_per_node: usize,
    /// Maximum pooled connections per node
    pub connection_queue_size: usize,
    /// Never open more than `connection_queue_size` connections to a node
    pub limit_connections_to_queue_size: bool,
    /// Maximum connections being opened to one node at the same time (0 = unlimited)
    pub opening_connection_threshold: usize,
    /// Fail `connect()` when no seed can be reached
    pub fail_if_not_connected: bool,
    /// Route reads to the client's racks when possible
    pub rack_aware: bool,
    /// Client racks, in order of preference
    pub rack_ids: Vec<i32>,
    /// Detect seeds that sit behind a load balancer
    pub detect_load_balancer: bool,
    /// Use `service-alt` instead of `service-clear-std` addresses
    pub use_services_alternate: bool,
    /// Errors allowed per node and window before commands are rejected (0 = unlimited)
    pub max_error_rate: usize,
    /// Tend passes per error-rate window
    pub error_rate_window: usize,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            cluster_name: None,
            timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(55),
            tend_interval: Duration::from_secs(1),
            min_connections_per_node: 0,
            connection_queue_size: 100,
            limit_connections_to_queue_size: true,
            opening_connection_threshold: 0,
            fail_if_not_connected: true,
            rack_aware: false,
            rack_ids: Vec::new(),
            detect_load_balancer: true,
            use_services_alternate: false,
            max_error_rate: 100,
            error_rate_window: 1,
        }
    }
}

impl ClientPolicy {
    /// Create a new builder
    pub fn builder() -> ClientPolicyBuilder {
        ClientPolicyBuilder::default()
    }

    /// Credentials are configured
    pub fn requires_auth(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Credentials to log new connections in with
    pub fn credentials(&self) -> Option<Credentials> {
        if !self.requires_auth() {
            return None;
        }
        let user = self.user.clone().unwrap_or_default();
        let password = self.password.clone().unwrap_or_default();
        Some(Credentials::new(user, password))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.connection_queue_size == 0 {
            return Err(Error::parameter("connection_queue_size must be greater than 0"));
        }
        if self.min_connections_per_node > self.connection_queue_size {
            return Err(Error::parameter(format!(
                "min_connections_per_node ({}) exceeds connection_queue_size ({})",
                self.min_connections_per_node, self.connection_queue_size
            )));
        }
        if self.tend_interval.is_zero() {
            return Err(Error::parameter("tend_interval must be greater than 0"));
        }
        if self.rack_aware && self.rack_ids.is_empty() {
            return Err(Error::parameter("rack_aware requires at least one rack id"));
        }
        if self.password.is_some() && !self.requires_auth() {
            return Err(Error::parameter("password set without a user"));
        }
        if self.max_error_rate > 0 && self.error_rate_window == 0 {
            return Err(Error::parameter("error_rate_window must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for ClientPolicy
#[derive(Default)]
pub struct ClientPolicyBuilder {
    policy: ClientPolicy,
}

impl ClientPolicyBuilder {
    /// Set user and password
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.policy.user = Some(user.into());
        self.policy.password = Some(password.into());
        self
    }

    /// Require every node to report this cluster name
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.policy.cluster_name = Some(name.into());
        self
    }

    /// Set connect/login/info timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    /// Set idle timeout for pooled connections
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.policy.idle_timeout = timeout;
        self
    }

    /// Set tend interval
    pub fn tend_interval(mut self, interval: Duration) -> Self {
        self.policy.tend_interval = interval;
        self
    }

    /// Set minimum connections per node
    pub fn min_connections_per_node(mut self, count: usize) -> Self {
        self.policy.min_connections_per_node = count;
        self
    }

    /// Set maximum pooled connections per node
    pub fn connection_queue_size(mut self, size: usize) -> Self {
        self.policy.connection_queue_size = size;
        self
    }

    pub fn limit_connections_to_queue_size(mut self, limit: bool) -> Self {
        self.policy.limit_connections_to_queue_size = limit;
        self
    }

    pub fn opening_connection_threshold(mut self, threshold: usize) -> Self {
        self.policy.opening_connection_threshold = threshold;
        self
    }

    pub fn fail_if_not_connected(mut self, fail: bool) -> Self {
        self.policy.fail_if_not_connected = fail;
        self
    }

    /// Set client racks and enable rack awareness
    pub fn rack_ids(mut self, rack_ids: Vec<i32>) -> Self {
        self.policy.rack_aware = !rack_ids.is_empty();
        self.policy.rack_ids = rack_ids;
        self
    }

    /// Enable or disable load balancer detection
    pub fn detect_load_balancer(mut self, detect: bool) -> Self {
        self.policy.detect_load_balancer = detect;
        self
    }

    pub fn use_services_alternate(mut self, alternate: bool) -> Self {
        self.policy.use_services_alternate = alternate;
        self
    }

    /// Set the error rate limit and its window in tend passes
    pub fn max_error_rate(mut self, rate: usize, window: usize) -> Self {
        self.policy.max_error_rate = rate;
        self.policy.error_rate_window = window;
        self
    }

    /// Build the policy
    pub fn build(self) -> ClientPolicy {
        self.policy
    }
}

// ============================================================================
// Per-operation Policy
// ============================================================================

/// Routing and retry settings for a single command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePolicy {
    pub replica: Replica,
    pub read_mode_sc: ReadModeSC,
    /// Deadline for the whole command including retries (zero = none)
    pub total_timeout: Duration,
    /// Deadline for a single socket round trip (zero = `total_timeout`)
    pub socket_timeout: Duration,
    pub max_retries: usize,
    pub sleep_between_retries: Duration,
    /// Growth factor applied to the sleep after every retry
    pub sleep_multiplier: f64,
    /// Give up at once when the node's pool is exhausted
    pub exit_fast_on_exhausted_connection_pool: bool,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            replica: Replica::Sequence,
            read_mode_sc: ReadModeSC::Session,
            total_timeout: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(30),
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(1),
            sleep_multiplier: 1.0,
            exit_fast_on_exhausted_connection_pool: false,
        }
    }
}

impl BasePolicy {
    /// Defaults for writes: no retries
    pub fn write_default() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Socket deadline for one attempt, capped by the time left on the command
    pub fn attempt_timeout(&self, remaining: Option<Duration>) -> Option<Duration> {
        let socket = (!self.socket_timeout.is_zero()).then_some(self.socket_timeout);
        match (socket, remaining) {
            (Some(s), Some(r)) => Some(s.min(r)),
            (s, r) => s.or(r),
        }
    }
}
