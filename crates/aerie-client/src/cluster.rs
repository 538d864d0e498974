//! Cluster registry and tend loop
//!
//! [`Cluster`] owns the live node registry and the published partition map. The
//! map is an immutable snapshot behind an `Arc`: commands clone the pointer and
//! route against it, merges build a new map under a single merge lock and swap it
//! in. A background task tends the cluster every `tend_interval`.

use crate::auth::Authenticator;
use crate::connection::Connector;
use crate::error::{Error, Result, ResultCode};
use crate::node::Node;
use crate::parser::PartitionParser;
use crate::partition_map::{PartitionMap, PARTITIONS};
use crate::policy::ClientPolicy;
use crate::validator::{NodeValidator, ValidatedNode};
use aerie_protocol::Host;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive refresh failures after which a node is dropped
pub const MAX_NODE_FAILURES: usize = 5;

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of cluster statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub tends: u64,
    pub partition_map_merges: u64,
    pub partition_map_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicClusterStats {
    nodes_added: AtomicU64,
    nodes_removed: AtomicU64,
    tends: AtomicU64,
    partition_map_merges: AtomicU64,
    partition_map_errors: AtomicU64,
}

impl AtomicClusterStats {
    fn snapshot(&self) -> ClusterStats {
        ClusterStats {
            nodes_added: self.nodes_added.load(Ordering::Relaxed),
            nodes_removed: self.nodes_removed.load(Ordering::Relaxed),
            tends: self.tends.load(Ordering::Relaxed),
            partition_map_merges: self.partition_map_merges.load(Ordering::Relaxed),
            partition_map_errors: self.partition_map_errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Client view of a cluster
pub struct Cluster {
    policy: Arc<ClientPolicy>,
    connector: Connector,
    seeds: RwLock<Vec<Host>>,
    nodes: RwLock<Vec<Arc<Node>>>,
    partition_map: RwLock<Arc<PartitionMap>>,
    /// Serializes partition map merges
    merge_lock: Mutex<()>,
    /// Serializes tend passes
    tend_lock: tokio::sync::Mutex<()>,
    parser: PartitionParser,
    node_index: AtomicUsize,
    replica_index: AtomicUsize,
    connection_hint: AtomicUsize,
    tend_count: AtomicU64,
    closed: AtomicBool,
    tend_handle: Mutex<Option<JoinHandle<()>>>,
    stats: AtomicClusterStats,
}

impl Cluster {
    /// Create a cluster for `seeds`. Nothing is contacted until [`Cluster::connect`].
    pub fn new(policy: ClientPolicy, seeds: Vec<Host>) -> Result<Arc<Self>> {
        Self::build(policy, seeds, None)
    }

    /// Create a cluster whose connections are logged in by `authenticator`
    pub fn with_authenticator(
        policy: ClientPolicy,
        seeds: Vec<Host>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>> {
        Self::build(policy, seeds, Some(authenticator))
    }

    fn build(
        policy: ClientPolicy,
        seeds: Vec<Host>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Arc<Self>> {
        policy.validate()?;
        let policy = Arc::new(policy);

        Ok(Arc::new(Self {
            connector: Connector::new(policy.clone(), authenticator),
            policy,
            seeds: RwLock::new(seeds),
            nodes: RwLock::new(Vec::new()),
            partition_map: RwLock::new(Arc::new(PartitionMap::new())),
            merge_lock: Mutex::new(()),
            tend_lock: tokio::sync::Mutex::new(()),
            parser: PartitionParser::new(PARTITIONS),
            node_index: AtomicUsize::new(0),
            replica_index: AtomicUsize::new(0),
            connection_hint: AtomicUsize::new(0),
            tend_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tend_handle: Mutex::new(None),
            stats: AtomicClusterStats::default(),
        }))
    }

    /// Seed the cluster, run the first tend and start the background tend task
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.seed().await {
            if self.policy.fail_if_not_connected {
                return Err(e);
            }
            warn!("Seeding failed, the tend loop will retry: {}", e);
        }

        self.tend().await;

        if self.policy.fail_if_not_connected && !self.is_connected() {
            return Err(Error::SERVER_NOT_AVAILABLE
                .err()
                .with_cause(Error::new(
                    ResultCode::InvalidNode,
                    "failed to connect to any seed host",
                )));
        }

        self.start_tend_loop();
        info!(
            "Connected to cluster with {} nodes and {} namespaces",
            self.node_count(),
            self.partitions().len()
        );
        Ok(())
    }

    fn start_tend_loop(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.policy.tend_interval;

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(cluster) = weak.upgrade() else {
                    break;
                };
                if cluster.closed.load(Ordering::Acquire) {
                    break;
                }
                cluster.tend().await;
            }
            debug!("Tend loop stopped");
        });

        if let Some(old) = self.tend_handle.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    /// Add a seed for future re-seeding
    pub fn add_seeds(&self, hosts: impl IntoIterator<Item = Host>) {
        let mut seeds = self.seeds.write();
        for host in hosts {
            if !seeds.iter().any(|s| s.same_address(&host)) {
                seeds.push(host);
            }
        }
    }

    pub fn seeds(&self) -> Vec<Host> {
        self.seeds.read().clone()
    }

    /// Validate the seeds and register nodes not yet known. Returns the number of
    /// nodes added.
    pub async fn seed(&self) -> Result<usize> {
        let seeds = self.seeds();
        let validated = NodeValidator::new(self.connector.clone())
            .seed_nodes(&seeds)
            .await?;
        self.add_validated(validated)
    }

    fn add_validated(&self, validated: Vec<ValidatedNode>) -> Result<usize> {
        let mut added = Vec::new();
        for mut v in validated {
            if self.get_node(&v.name).is_some() {
                if let Some(mut conn) = v.conn.take() {
                    conn.close();
                }
                continue;
            }
            added.push(Arc::new(Node::new(v, self.connector.clone())?));
        }
        let count = added.len();
        self.add_nodes(added);
        Ok(count)
    }

    // ========================================================================
    // Node registry
    // ========================================================================

    /// Register nodes. Nodes whose name is already registered are ignored.
    pub fn add_nodes(&self, nodes: Vec<Arc<Node>>) {
        let mut registry = self.nodes.write();
        for node in nodes {
            if registry.iter().any(|n| n.name() == node.name()) {
                continue;
            }
            info!("Adding node {}", node);
            self.stats.nodes_added.fetch_add(1, Ordering::Relaxed);
            registry.push(node);
        }
    }

    /// Snapshot of the registered nodes
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.name() == name).cloned()
    }

    /// Next active node, round robin
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.read();
        for _ in 0..nodes.len() {
            let index = self.node_index.fetch_add(1, Ordering::Relaxed) % nodes.len();
            if nodes[index].is_active() {
                return Ok(nodes[index].clone());
            }
        }
        Err(Error::CLUSTER_IS_EMPTY.err())
    }

    /// Shared counter for master/prole round robin
    pub fn next_replica_index(&self) -> usize {
        self.replica_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Pool shard hint for the next command
    pub fn next_connection_hint(&self) -> u8 {
        (self.connection_hint.fetch_add(1, Ordering::Relaxed) % 256) as u8
    }

    pub fn rack_ids(&self) -> &[i32] {
        &self.policy.rack_ids
    }

    /// Connected while at least one node is registered and the cluster is open
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.node_count() > 0
    }

    /// Drop a node from the registry and the partition map, then close it
    pub fn remove_node(&self, name: &str) -> Option<Arc<Node>> {
        let node = {
            let mut registry = self.nodes.write();
            let index = registry.iter().position(|n| n.name() == name)?;
            registry.remove(index)
        };

        let removed = {
            let _guard = self.merge_lock.lock();
            let mut map = PartitionMap::clone(&self.partitions());
            let removed = map.remove_node(&node);
            if removed > 0 {
                *self.partition_map.write() = Arc::new(map);
            }
            removed
        };

        info!("Removing node {}, {} partition slots released", node, removed);
        self.stats.nodes_removed.fetch_add(1, Ordering::Relaxed);
        node.close();
        Some(node)
    }

    // ========================================================================
    // Partition map
    // ========================================================================

    /// Current partition map snapshot
    pub fn partitions(&self) -> Arc<PartitionMap> {
        self.partition_map.read().clone()
    }

    /// Merge a raw partition map reply announced by node `node_name`
    pub fn merge_topology(&self, node_name: &str, raw: &str) -> Result<()> {
        let node = self.get_node(node_name).ok_or_else(|| {
            Error::new(
                ResultCode::InvalidNode,
                format!("node {} is not registered", node_name),
            )
        })?;
        self.merge_partitions(&node, raw)
    }

    /// Parse `raw` fully, then merge it into a copy of the current map and publish
    /// the copy. A reply that fails to parse leaves the published map untouched.
    pub(crate) fn merge_partitions(&self, node: &Arc<Node>, raw: &str) -> Result<()> {
        let update = match self.parser.parse(raw) {
            Ok(update) => update,
            Err(e) => {
                self.stats.partition_map_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.with_node(node));
            }
        };

        let outcome = {
            let _guard = self.merge_lock.lock();
            let mut map = PartitionMap::clone(&self.partitions());
            let outcome = self.parser.merge(&update, &mut map, node);
            if let Err(e) = map.validate() {
                debug!("Partition map after merge from node {}: {}", node, e);
            }
            *self.partition_map.write() = Arc::new(map);
            node.set_partition_generation(update.generation);
            outcome
        };
        self.stats.partition_map_merges.fetch_add(1, Ordering::Relaxed);

        for previous in &outcome.previous_owners {
            if !Arc::ptr_eq(previous, node) {
                previous.invalidate_partition_generation();
            }
        }

        debug!(
            "Merged partition map generation {} from node {}: {} slots changed, {} previous owners",
            update.generation,
            node,
            outcome.changed,
            outcome.previous_owners.len()
        );
        Ok(())
    }

    // ========================================================================
    // Tend
    // ========================================================================

    /// One tend pass: refresh nodes, re-fetch changed partition maps, drop dead
    /// nodes and maintain connection pools
    pub async fn tend(&self) {
        let _tend = self.tend_lock.lock().await;
        let tend_count = self.tend_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.tends.fetch_add(1, Ordering::Relaxed);

        if self.node_count() == 0 {
            match self.seed().await {
                Ok(added) if added > 0 => info!("Re-seeded cluster with {} nodes", added),
                Ok(_) => {}
                Err(e) => {
                    warn!("Re-seeding failed: {}", e);
                    return;
                }
            }
        }

        let nodes = self.nodes();
        let mut refreshes = JoinSet::new();
        for node in &nodes {
            let node = node.clone();
            refreshes.spawn(async move {
                let result = node.refresh().await;
                (node, result)
            });
        }

        let mut refreshed = Vec::with_capacity(nodes.len());
        while let Some(joined) = refreshes.join_next().await {
            match joined {
                Ok((node, Ok(()))) => refreshed.push(node),
                Ok((_, Err(_))) => {}
                Err(e) => warn!("Node refresh task failed: {}", e),
            }
        }

        for node in refreshed {
            if node.is_active() && node.partition_changed() {
                self.refresh_partitions(&node).await;
            }
        }

        for node in &nodes {
            if !node.is_active() || node.failures() >= MAX_NODE_FAILURES {
                self.remove_node(node.name());
            }
        }

        let window = self.policy.error_rate_window.max(1) as u64;
        if self.policy.max_error_rate > 0 && tend_count % window == 0 {
            for node in self.nodes() {
                node.reset_error_count();
            }
        }

        for node in self.nodes() {
            node.fill_min_connections().await;
            node.drop_idle_connections();
        }
    }

    async fn refresh_partitions(&self, node: &Arc<Node>) {
        let raw = match node.request_partition_map().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to fetch partition map from node {}: {}", node, e);
                node.invalidate_partition_generation();
                return;
            }
        };
        if let Err(e) = self.merge_partitions(node, &raw) {
            warn!("Failed to merge partition map from node {}: {}", node, e);
            node.invalidate_partition_generation();
        }
    }

    /// Stop tending, close every node and clear the partition map
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.tend_handle.lock().take() {
            handle.abort();
        }

        let nodes: Vec<Arc<Node>> = std::mem::take(&mut *self.nodes.write());
        for node in &nodes {
            node.close();
        }
        *self.partition_map.write() = Arc::new(PartitionMap::new());
        info!("Cluster closed, {} nodes released", nodes.len());
    }

    pub fn stats(&self) -> ClusterStats {
        self.stats.snapshot()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(handle) = self.tend_handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.node_count())
            .field("namespaces", &self.partitions().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Cluster with pre-built nodes and no seeds, for unit tests
#[cfg(test)]
pub(crate) fn test_cluster(policy: ClientPolicy, nodes: Vec<Arc<Node>>) -> Arc<Cluster> {
    let cluster = Cluster::new(policy, Vec::new()).expect("valid test policy");
    cluster.add_nodes(nodes);
    cluster
}
