//! Cluster node
//!
//! A [`Node`] is one live cluster member as seen by the client: its identity, the
//! connection pool used by commands, a dedicated tend connection used for info
//! requests, rack membership and the generation counters the tend loop uses to
//! decide when the partition map must be re-fetched.

use crate::auth::SessionInfo;
use crate::connection::{Connection, Connector};
use crate::error::{Error, Result, ResultCode};
use crate::pool::ConnectionHeap;
use crate::validator::ValidatedNode;
use aerie_protocol::Host;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Node supports partition scans
pub const FEATURE_PARTITION_SCAN: u32 = 1 << 0;
/// Node supports `query-show`
pub const FEATURE_QUERY_SHOW: u32 = 1 << 1;

/// Partition generation of a node whose map has not been fetched yet
pub const GENERATION_UNKNOWN: i64 = -1;

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub connections_attempts: u64,
    pub connections_successful: u64,
    pub connections_failed: u64,
    pub connections_pool_empty: u64,
    pub connections_closed: u64,
    pub tends_total: u64,
    pub tends_successful: u64,
    pub tends_failed: u64,
    pub partition_map_updates: u64,
    pub error_rate_hits: u64,
}

#[derive(Debug, Default)]
struct AtomicNodeStats {
    connections_attempts: AtomicU64,
    connections_successful: AtomicU64,
    connections_failed: AtomicU64,
    connections_pool_empty: AtomicU64,
    connections_closed: AtomicU64,
    tends_total: AtomicU64,
    tends_successful: AtomicU64,
    tends_failed: AtomicU64,
    partition_map_updates: AtomicU64,
    error_rate_hits: AtomicU64,
}

impl AtomicNodeStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> NodeStats {
        NodeStats {
            connections_attempts: self.connections_attempts.load(Ordering::Relaxed),
            connections_successful: self.connections_successful.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_pool_empty: self.connections_pool_empty.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            tends_total: self.tends_total.load(Ordering::Relaxed),
            tends_successful: self.tends_successful.load(Ordering::Relaxed),
            tends_failed: self.tends_failed.load(Ordering::Relaxed),
            partition_map_updates: self.partition_map_updates.load(Ordering::Relaxed),
            error_rate_hits: self.error_rate_hits.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// One cluster member
pub struct Node {
    name: String,
    host: Host,
    aliases: RwLock<Vec<Host>>,
    features: u32,
    connector: Connector,
    session: RwLock<Option<SessionInfo>>,
    pool: ConnectionHeap,
    tend_conn: tokio::sync::Mutex<Option<Connection>>,
    racks: RwLock<HashMap<String, i32>>,
    active: AtomicBool,
    partition_generation: AtomicI64,
    partition_changed: AtomicBool,
    failures: AtomicUsize,
    error_count: AtomicUsize,
    connection_count: AtomicUsize,
    opening_count: AtomicUsize,
    stats: AtomicNodeStats,
}

impl Node {
    /// Build a node from a validated seed. The validation connection becomes the
    /// tend connection.
    pub fn new(validated: ValidatedNode, connector: Connector) -> Result<Self> {
        let policy = connector.policy();
        let pool = ConnectionHeap::new(policy.min_connections_per_node, policy.connection_queue_size)?;

        Ok(Self {
            name: validated.name,
            host: validated.primary_host,
            aliases: RwLock::new(validated.aliases),
            features: validated.features,
            session: RwLock::new(validated.session),
            pool,
            tend_conn: tokio::sync::Mutex::new(validated.conn),
            racks: RwLock::new(HashMap::new()),
            active: AtomicBool::new(true),
            partition_generation: AtomicI64::new(GENERATION_UNKNOWN),
            partition_changed: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            connection_count: AtomicUsize::new(0),
            opening_count: AtomicUsize::new(0),
            stats: AtomicNodeStats::default(),
            connector,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary address
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn aliases(&self) -> Vec<Host> {
        self.aliases.read().clone()
    }

    pub fn add_alias(&self, alias: Host) {
        let mut aliases = self.aliases.write();
        if !aliases.iter().any(|a| a.same_address(&alias)) {
            aliases.push(alias);
        }
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    pub fn supports_feature(&self, feature: u32) -> bool {
        self.features & feature == feature
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.session.read().clone()
    }

    /// Active and not marked for removal
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && self.partition_generation.load(Ordering::Acquire) >= GENERATION_UNKNOWN
    }

    pub fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn partition_generation(&self) -> i64 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_partition_generation(&self, generation: i64) {
        self.partition_generation.store(generation, Ordering::Release);
        self.partition_changed.store(false, Ordering::Release);
        AtomicNodeStats::incr(&self.stats.partition_map_updates);
    }

    /// Force a partition map re-fetch on the next tend
    pub fn invalidate_partition_generation(&self) {
        self.partition_generation
            .store(GENERATION_UNKNOWN, Ordering::Release);
        self.partition_changed.store(true, Ordering::Release);
    }

    /// The last refresh saw a new partition generation
    pub fn partition_changed(&self) -> bool {
        self.partition_changed.load(Ordering::Acquire)
    }

    /// Consecutive failed refreshes
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Acquire)
    }

    // ========================================================================
    // Racks
    // ========================================================================

    /// Rack of this node for `namespace`
    pub fn rack(&self, namespace: &str) -> Option<i32> {
        self.racks.read().get(namespace).copied()
    }

    pub fn has_rack(&self, namespace: &str, rack_id: i32) -> bool {
        self.rack(namespace) == Some(rack_id)
    }

    pub fn set_racks(&self, racks: HashMap<String, i32>) {
        *self.racks.write() = racks;
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Lease a pooled connection or open a new one
    pub async fn get_connection(&self, timeout: Duration, hint: u8) -> Result<Connection> {
        while let Some(mut conn) = self.pool.poll(hint) {
            if conn.is_connected() {
                conn.set_timeout(Some(timeout));
                return Ok(conn);
            }
            self.close_connection(conn);
        }

        let policy = self.connector.policy();
        let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        if policy.limit_connections_to_queue_size && count > policy.connection_queue_size {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
            AtomicNodeStats::incr(&self.stats.connections_pool_empty);
            return Err(Error::CONNECTION_POOL_EXHAUSTED
                .err()
                .with_cause(Error::TOO_MANY_CONNECTIONS_FOR_NODE.err())
                .with_node(self));
        }

        let threshold = policy.opening_connection_threshold;
        if threshold > 0 {
            let opening = self.opening_count.fetch_add(1, Ordering::AcqRel) + 1;
            if opening > threshold {
                self.opening_count.fetch_sub(1, Ordering::AcqRel);
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                AtomicNodeStats::incr(&self.stats.connections_pool_empty);
                return Err(Error::CONNECTION_POOL_EMPTY
                    .err()
                    .with_cause(Error::TOO_MANY_OPENING_CONNECTIONS.err())
                    .with_node(self));
            }
        }

        let opened = self.new_connection().await;
        if threshold > 0 {
            self.opening_count.fetch_sub(1, Ordering::AcqRel);
        }

        match opened {
            Ok(mut conn) => {
                conn.set_timeout(Some(timeout));
                Ok(conn)
            }
            Err(e) => {
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Give a connection back. It is closed when the node went inactive or the pool
    /// is full.
    pub fn put_connection(&self, mut conn: Connection, hint: u8) {
        conn.refresh();
        if !self.active.load(Ordering::Acquire) || !conn.is_connected() {
            self.close_connection(conn);
            return;
        }
        if let Err(conn) = self.pool.offer(conn, hint) {
            self.close_connection(conn);
        }
    }

    /// Close a connection that came from this node
    pub fn close_connection(&self, mut conn: Connection) {
        conn.close();
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
        AtomicNodeStats::incr(&self.stats.connections_closed);
    }

    /// Open up to `count` connections into the pool (0 = fill the pool). Returns the
    /// number added.
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let capacity = self.pool.max_size();
        let to_alloc = capacity.saturating_sub(self.connection_count.load(Ordering::Acquire));
        let count = if count == 0 || count > to_alloc {
            to_alloc
        } else {
            count
        };

        let mut added = 0;
        for i in 0..count {
            self.connection_count.fetch_add(1, Ordering::AcqRel);
            let conn = match self.new_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.connection_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            };
            match self.pool.offer(conn, (i % 256) as u8) {
                Ok(()) => added += 1,
                Err(conn) => {
                    self.close_connection(conn);
                    break;
                }
            }
        }

        if added > 0 {
            debug!("Warmed up {} connections to node {}", added, self);
        }
        Ok(added)
    }

    /// Top the pool up to the configured minimum
    pub(crate) async fn fill_min_connections(&self) {
        let min = self.pool.min_size();
        let live = self.connection_count.load(Ordering::Acquire);
        if min > live {
            if let Err(e) = self.warm_up(min - live).await {
                debug!("Failed to fill minimum connections for node {}: {}", self, e);
            }
        }
    }

    /// Close idle pooled connections down to the minimum
    pub fn drop_idle_connections(&self) -> usize {
        let dropped = self.pool.drop_idle();
        if dropped > 0 {
            self.connection_count.fetch_sub(dropped, Ordering::AcqRel);
            self.stats
                .connections_closed
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Connections currently open to this node, pooled or leased
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    /// Pooled connections
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }

    async fn new_connection(&self) -> Result<Connection> {
        AtomicNodeStats::incr(&self.stats.connections_attempts);
        match self.connector.open(&self.host).await {
            Ok((conn, session)) => {
                if session.is_some() {
                    *self.session.write() = session;
                }
                AtomicNodeStats::incr(&self.stats.connections_successful);
                Ok(conn)
            }
            Err(e) => {
                AtomicNodeStats::incr(&self.stats.connections_failed);
                Err(e.with_node(self))
            }
        }
    }

    // ========================================================================
    // Error rate
    // ========================================================================

    pub fn incr_error_count(&self) {
        if self.connector.policy().max_error_rate > 0 {
            self.error_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn reset_error_count(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }

    /// Reject commands while the node is over its error budget
    pub fn validate_error_count(&self) -> Result<()> {
        let max = self.connector.policy().max_error_rate;
        if max > 0 && self.error_count() > max {
            AtomicNodeStats::incr(&self.stats.error_rate_hits);
            return Err(Error::MAX_ERROR_RATE.err().with_node(self));
        }
        Ok(())
    }

    // ========================================================================
    // Info requests & refresh
    // ========================================================================

    /// Run an info request on the tend connection
    pub async fn request_info<S: AsRef<str>>(&self, names: &[S]) -> Result<HashMap<String, String>> {
        let body = self.request_info_raw(names).await?;
        Ok(aerie_protocol::info::parse_response(&body))
    }

    /// Run an info request on the tend connection and return the raw body
    pub async fn request_info_raw<S: AsRef<str>>(&self, names: &[S]) -> Result<String> {
        let mut guard = self.tend_conn.lock().await;
        if !guard.as_ref().is_some_and(Connection::is_connected) {
            let (conn, _) = self.connector.open(&self.host).await?;
            *guard = Some(conn);
        }

        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::from_code(ResultCode::NetworkError).with_node(self)),
        };
        conn.set_timeout(Some(self.connector.policy().timeout));

        let result = conn.request_info_raw(names).await;
        // a node closed while the request was in flight keeps no tend connection
        if result.is_err() || !self.active.load(Ordering::Acquire) {
            if let Some(mut conn) = guard.take() {
                conn.close();
            }
        }
        result.map_err(|e| e.with_node(self))
    }

    /// Fetch the raw partition map reply
    pub async fn request_partition_map(&self) -> Result<String> {
        self.request_info_raw(&["partition-generation", "replicas"])
            .await
    }

    /// Tend this node: confirm its identity, pick up the partition generation and
    /// rack membership.
    pub async fn refresh(&self) -> Result<()> {
        AtomicNodeStats::incr(&self.stats.tends_total);

        let rack_aware = self.connector.policy().rack_aware;
        let mut names = vec!["node", "partition-generation"];
        if rack_aware {
            names.push("racks:");
        }

        let result = match self.request_info(&names).await {
            Ok(map) => self.apply_refresh(&map, rack_aware),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.failures.store(0, Ordering::Release);
                AtomicNodeStats::incr(&self.stats.tends_successful);
                Ok(())
            }
            Err(e) => {
                self.refresh_failed(&e);
                Err(e)
            }
        }
    }

    fn apply_refresh(&self, map: &HashMap<String, String>, rack_aware: bool) -> Result<()> {
        self.verify_node_name(map)?;

        let generation = parse_generation(map)?;
        if self.partition_generation() != generation {
            debug!(
                "Node {} partition generation changed {} -> {}",
                self,
                self.partition_generation(),
                generation
            );
            self.partition_changed.store(true, Ordering::Release);
        }

        if rack_aware {
            let value = map.get("racks:").map(String::as_str).unwrap_or_default();
            self.set_racks(parse_racks(value, &self.name)?);
        }
        Ok(())
    }

    fn verify_node_name(&self, map: &HashMap<String, String>) -> Result<()> {
        match map.get("node").map(String::as_str) {
            None | Some("") => Err(Error::new(ResultCode::InvalidNode, "node name is empty")),
            Some(name) if name != self.name => {
                self.set_inactive();
                Err(Error::new(
                    ResultCode::InvalidNode,
                    format!("node name has changed: old={} new={}", self.name, name),
                ))
            }
            Some(_) => Ok(()),
        }
    }

    fn refresh_failed(&self, e: &Error) {
        self.partition_generation
            .store(GENERATION_UNKNOWN, Ordering::Release);
        self.failures.fetch_add(1, Ordering::AcqRel);
        AtomicNodeStats::incr(&self.stats.tends_failed);
        warn!("Node {} refresh failed: {}", self, e);
    }

    /// Drain the pool and deactivate. A tend connection busy with a refresh is
    /// closed when that refresh completes.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("Closing node {}", self);
        }
        self.pool.cleanup();
        if let Ok(mut guard) = self.tend_conn.try_lock() {
            if let Some(mut conn) = guard.take() {
                conn.close();
            }
        }
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.snapshot()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.host)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("active", &self.is_active())
            .field("partition_generation", &self.partition_generation())
            .finish()
    }
}

/// Read `partition-generation` from an info reply
pub(crate) fn parse_generation(map: &HashMap<String, String>) -> Result<i64> {
    let value = map
        .get("partition-generation")
        .ok_or_else(|| Error::parse("partition-generation missing from info reply"))?;
    value
        .trim()
        .parse()
        .map_err(|_| Error::parse(format!("invalid partition-generation: {}", value)))
}

/// Parse a `racks:` reply into the rack of `node_name` per namespace.
///
/// Format: `ns=<ns>:rack_<id>=<node>,<node>:rack_<id>=<node>;ns=...`
pub fn parse_racks(value: &str, node_name: &str) -> Result<HashMap<String, i32>> {
    if value.trim_start().to_ascii_uppercase().starts_with("ERROR") {
        return Err(Error::new(
            ResultCode::UnsupportedFeature,
            "rack awareness is enabled but the server does not support it",
        ));
    }

    let mut racks = HashMap::new();
    for segment in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = segment.split(':');
        let namespace = parts
            .next()
            .and_then(|p| p.strip_prefix("ns="))
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::parse(format!("invalid racks segment: {}", segment)))?;

        for part in parts {
            let (rack, nodes) = part
                .strip_prefix("rack_")
                .and_then(|p| p.split_once('='))
                .ok_or_else(|| Error::parse(format!("invalid racks segment: {}", segment)))?;
            let rack: i32 = rack
                .parse()
                .map_err(|_| Error::parse(format!("invalid rack id: {}", rack)))?;

            if nodes.split(',').any(|n| n == node_name) {
                racks.insert(namespace.to_string(), rack);
            }
        }
    }
    Ok(racks)
}

/// Unconnected node for unit tests
#[cfg(test)]
pub(crate) fn test_node(name: &str, policy: crate::policy::ClientPolicy) -> Node {
    let validated = ValidatedNode {
        name: name.to_string(),
        primary_host: Host::new("127.0.0.1", 1),
        aliases: vec![Host::new("127.0.0.1", 1)],
        features: FEATURE_PARTITION_SCAN,
        session: None,
        conn: None,
    };
    Node::new(validated, Connector::new(std::sync::Arc::new(policy), None))
        .expect("valid test policy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClientPolicy;

    #[test]
    fn test_parse_racks() {
        let racks = parse_racks(
            "ns=test:rack_1=A1,B1:rack_2=C1;ns=bar:rack_7=C1,A1;",
            "A1",
        )
        .unwrap();
        assert_eq!(racks.len(), 2);
        assert_eq!(racks["test"], 1);
        assert_eq!(racks["bar"], 7);

        let racks = parse_racks("ns=test:rack_1=A1,B1:rack_2=C1", "C1").unwrap();
        assert_eq!(racks["test"], 2);

        assert!(parse_racks("", "A1").unwrap().is_empty());
    }

    #[test]
    fn test_parse_racks_errors() {
        let err = parse_racks("ERROR::unsupported", "A1").unwrap_err();
        assert_eq!(err.code(), ResultCode::UnsupportedFeature);

        assert!(parse_racks("test:rack_1=A1", "A1").is_err());
        assert!(parse_racks("ns=test:rack_x=A1", "A1").is_err());
    }

    #[test]
    fn test_parse_generation() {
        let mut map = HashMap::new();
        map.insert("partition-generation".to_string(), "12".to_string());
        assert_eq!(parse_generation(&map).unwrap(), 12);

        map.insert("partition-generation".to_string(), "x".to_string());
        assert!(parse_generation(&map).is_err());
        assert!(parse_generation(&HashMap::new()).is_err());
    }

    #[test]
    fn test_new_node_needs_sync() {
        let node = test_node("A1", ClientPolicy::default());
        assert!(node.is_active());
        assert_eq!(node.partition_generation(), GENERATION_UNKNOWN);
        assert!(node.partition_changed());

        node.set_partition_generation(5);
        assert!(!node.partition_changed());
        node.invalidate_partition_generation();
        assert_eq!(node.partition_generation(), GENERATION_UNKNOWN);
        assert!(node.partition_changed());
        assert!(node.is_active());

        node.set_inactive();
        assert!(!node.is_active());
    }

    #[test]
    fn test_verify_node_name_deactivates() {
        let node = test_node("A1", ClientPolicy::default());
        let mut map = HashMap::new();
        map.insert("node".to_string(), "A1".to_string());
        assert!(node.verify_node_name(&map).is_ok());

        map.insert("node".to_string(), "B1".to_string());
        let err = node.verify_node_name(&map).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidNode);
        assert!(!node.is_active());
    }

    #[test]
    fn test_error_rate() {
        let policy = ClientPolicy::builder().max_error_rate(2, 1).build();
        let node = test_node("A1", policy);
        node.incr_error_count();
        node.incr_error_count();
        assert!(node.validate_error_count().is_ok());

        node.incr_error_count();
        let err = node.validate_error_count().unwrap_err();
        assert!(err.is(&Error::MAX_ERROR_RATE));
        assert_eq!(node.stats().error_rate_hits, 1);

        node.reset_error_count();
        assert!(node.validate_error_count().is_ok());
    }

    #[test]
    fn test_aliases_are_deduplicated() {
        let node = test_node("A1", ClientPolicy::default());
        node.add_alias(Host::new("127.0.0.1", 1));
        node.add_alias(Host::new("localhost", 1));
        assert_eq!(node.aliases().len(), 2);
    }

    #[tokio::test]
    async fn test_get_connection_respects_queue_limit() {
        let policy = ClientPolicy::builder().connection_queue_size(1).build();
        let node = test_node("A1", policy);
        // pretend one connection is already leased
        node.connection_count.store(1, Ordering::Release);

        let err = node
            .get_connection(Duration::from_millis(100), 0)
            .await
            .unwrap_err();
        assert!(err.is(&Error::CONNECTION_POOL_EXHAUSTED));
        assert_eq!(node.connection_count(), 1);
        assert_eq!(node.stats().connections_pool_empty, 1);
    }

    #[tokio::test]
    async fn test_get_connection_respects_opening_threshold() {
        let policy = ClientPolicy::builder().opening_connection_threshold(1).build();
        let node = test_node("A1", policy);
        node.opening_count.store(1, Ordering::Release);

        let err = node
            .get_connection(Duration::from_millis(100), 0)
            .await
            .unwrap_err();
        assert!(err.is(&Error::CONNECTION_POOL_EMPTY));
        assert_eq!(node.connection_count(), 0);
    }
}
