//! Per-command partition context and replica selection
//!
//! A [`Partition`] lives for one command. It snapshots the namespace table when the
//! command starts, picks a node according to the replica policy and advances its
//! retry sequence when an attempt fails, so the next attempt can land on another
//! replica.

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::partition_map::{PartitionMap, Partitions, PARTITIONS};
use crate::policy::{BasePolicy, ReadModeSC, Replica};
use std::fmt;
use std::sync::{Arc, Weak};

/// Length of a key digest
pub const DIGEST_SIZE: usize = 20;

/// Partition owning a key digest: low 12 bits of the first little-endian word
pub fn partition_id_for(digest: &[u8; DIGEST_SIZE]) -> usize {
    let word = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (word & 0xFFFF) as usize % PARTITIONS
}

/// Routing state of one command
pub struct Partition {
    namespace: String,
    partition_id: usize,
    partitions: Arc<Partitions>,
    replica: Replica,
    sequence: usize,
    prev_node: Weak<Node>,
    linearize: bool,
}

impl Partition {
    pub fn new(
        namespace: impl Into<String>,
        partition_id: usize,
        partitions: Arc<Partitions>,
        replica: Replica,
        linearize: bool,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            partition_id,
            partitions,
            replica,
            sequence: 0,
            prev_node: Weak::new(),
            linearize,
        }
    }

    /// Context for a write. The replica policy is taken as is.
    pub fn for_write(
        map: &PartitionMap,
        policy: &BasePolicy,
        namespace: &str,
        digest: &[u8; DIGEST_SIZE],
    ) -> Result<Self> {
        let partitions = map.partitions(namespace)?.clone();
        Ok(Self::new(
            namespace,
            partition_id_for(digest),
            partitions,
            policy.replica,
            false,
        ))
    }

    /// Context for a read. Strong-consistency namespaces override the replica
    /// policy: session reads go to the master, linearized reads never use rack
    /// preference and keep their replica on client timeouts.
    pub fn for_read(
        map: &PartitionMap,
        policy: &BasePolicy,
        namespace: &str,
        digest: &[u8; DIGEST_SIZE],
    ) -> Result<Self> {
        let partitions = map.partitions(namespace)?.clone();

        let (replica, linearize) = if partitions.sc_mode() {
            match policy.read_mode_sc {
                ReadModeSC::Session => (Replica::Master, false),
                ReadModeSC::Linearize => match policy.replica {
                    Replica::PreferRack => (Replica::Sequence, true),
                    replica => (replica, true),
                },
                ReadModeSC::AllowReplica | ReadModeSC::AllowUnavailable => (policy.replica, false),
            }
        } else {
            (policy.replica, false)
        };

        Ok(Self::new(
            namespace,
            partition_id_for(digest),
            partitions,
            replica,
            linearize,
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn replica(&self) -> Replica {
        self.replica
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn linearize(&self) -> bool {
        self.linearize
    }

    /// Node chosen by the last rack-aware selection, if it is still alive
    pub fn prev_node(&self) -> Option<Arc<Node>> {
        self.prev_node.upgrade()
    }

    /// Pick the node for a read attempt
    pub fn get_node_read(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        match self.replica {
            Replica::Sequence => self.sequence_node(cluster),
            Replica::PreferRack => self.rack_node(cluster),
            Replica::Master => self.master_node(cluster),
            Replica::MasterProles => self.master_proles_node(cluster),
            Replica::Random => cluster.random_node(),
        }
    }

    /// Pick the node for a write attempt. Writes only follow the sequence chain;
    /// the read-only policies go to the master.
    pub fn get_node_write(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        match self.replica {
            Replica::Sequence => self.sequence_node(cluster),
            Replica::PreferRack => self.rack_node(cluster),
            Replica::Master | Replica::MasterProles | Replica::Random => self.master_node(cluster),
        }
    }

    pub fn get_node(&mut self, cluster: &Cluster, is_read: bool) -> Result<Arc<Node>> {
        if is_read {
            self.get_node_read(cluster)
        } else {
            self.get_node_write(cluster)
        }
    }

    /// Advance to the next replica after a failed read. A linearized read that
    /// timed out on the client stays on the same replica.
    pub fn prepare_retry_read(&mut self, is_client_timeout: bool) {
        if !is_client_timeout || !self.linearize {
            self.sequence += 1;
        }
    }

    /// Advance to the next replica after a failed write, unless the client timed out
    pub fn prepare_retry_write(&mut self, is_client_timeout: bool) {
        if !is_client_timeout {
            self.sequence += 1;
        }
    }

    pub fn prepare_retry(&mut self, is_read: bool, is_client_timeout: bool) {
        if is_read {
            self.prepare_retry_read(is_client_timeout);
        } else {
            self.prepare_retry_write(is_client_timeout);
        }
    }

    fn slot(&self, level: usize) -> Option<&Arc<Node>> {
        self.partitions.node(level, self.partition_id)
    }

    fn sequence_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        let levels = self.partitions.replica_count();
        for _ in 0..levels {
            let level = self.sequence % levels;
            if let Some(node) = self.slot(level).filter(|n| n.is_active()) {
                return Ok(node.clone());
            }
            self.sequence += 1;
        }
        Err(self.invalid_node(cluster))
    }

    fn master_node(&self, cluster: &Cluster) -> Result<Arc<Node>> {
        match self.slot(0).filter(|n| n.is_active()) {
            Some(node) => Ok(node.clone()),
            None => Err(self.invalid_node(cluster)),
        }
    }

    fn master_proles_node(&self, cluster: &Cluster) -> Result<Arc<Node>> {
        let levels = self.partitions.replica_count();
        for _ in 0..levels {
            let level = cluster.next_replica_index() % levels;
            if let Some(node) = self.slot(level).filter(|n| n.is_active()) {
                return Ok(node.clone());
            }
        }
        Err(self.invalid_node(cluster))
    }

    /// Rack ids are searched in configured order and, within a rack, replicas in
    /// sequence order. The first active node on the rack that is not the previous
    /// node wins. Otherwise fall back to the first active off-rack node, then to
    /// the previous node, then to plain sequence order.
    fn rack_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        let partitions = self.partitions.clone();
        let levels = partitions.replica_count();
        let prev = self.prev_node.upgrade();
        let mut fallback: Option<(usize, Arc<Node>)> = None;
        let mut fallback_prev: Option<(usize, Arc<Node>)> = None;

        for &rack_id in cluster.rack_ids() {
            let mut seq = self.sequence;
            for _ in 0..levels {
                if let Some(node) = partitions.node(seq % levels, self.partition_id) {
                    let is_prev = prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, node));
                    if !is_prev {
                        if node.has_rack(&self.namespace, rack_id) {
                            if node.is_active() {
                                let node = node.clone();
                                self.sequence = seq;
                                self.prev_node = Arc::downgrade(&node);
                                return Ok(node);
                            }
                        } else if fallback.is_none() && node.is_active() {
                            fallback = Some((seq, node.clone()));
                        }
                    } else if fallback_prev.is_none() && node.is_active() {
                        fallback_prev = Some((seq, node.clone()));
                    }
                }
                seq += 1;
            }
        }

        match fallback.or(fallback_prev) {
            Some((seq, node)) => {
                self.sequence = seq;
                self.prev_node = Arc::downgrade(&node);
                Ok(node)
            }
            None => self.sequence_node(cluster),
        }
    }

    fn invalid_node(&self, cluster: &Cluster) -> Error {
        Error::invalid_node(cluster.node_count(), self)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.partition_id)
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("namespace", &self.namespace)
            .field("partition_id", &self.partition_id)
            .field("replica", &self.replica)
            .field("sequence", &self.sequence)
            .field("linearize", &self.linearize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_cluster;
    use crate::error::ResultCode;
    use crate::node::test_node;
    use crate::policy::ClientPolicy;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const NS: &str = "test";

    fn node(name: &str, rack: Option<i32>) -> Arc<Node> {
        let node = Arc::new(test_node(name, ClientPolicy::default()));
        if let Some(rack) = rack {
            node.set_racks(HashMap::from([(NS.to_string(), rack)]));
        }
        node
    }

    /// One partition (id 0) owned by `owners[level]`
    fn table(owners: &[Option<&Arc<Node>>]) -> Arc<Partitions> {
        let mut p = Partitions::new(4, owners.len(), false);
        for (level, owner) in owners.iter().enumerate() {
            if let Some(node) = owner {
                p.set_node(level, 0, (*node).clone());
            }
        }
        Arc::new(p)
    }

    #[test]
    fn test_partition_id_for_digest() {
        let mut digest = [0u8; DIGEST_SIZE];
        assert_eq!(partition_id_for(&digest), 0);

        digest[0] = 0x01;
        digest[1] = 0x10;
        assert_eq!(partition_id_for(&digest), 0x1001 % PARTITIONS);

        // only the low 16 bits count
        digest[2] = 0xFF;
        digest[3] = 0xFF;
        assert_eq!(partition_id_for(&digest), 0x1001 % PARTITIONS);
    }

    #[test]
    fn test_sequence_walks_replicas() {
        let a = node("A", None);
        let b = node("B", None);
        let cluster = test_cluster(ClientPolicy::default(), vec![a.clone(), b.clone()]);
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::Sequence, false);

        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));
        p.prepare_retry_read(false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &b));
        p.prepare_retry_read(false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));

        // inactive master is skipped
        a.set_inactive();
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::Sequence, false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &b));
        assert_eq!(p.sequence(), 1);
    }

    #[test]
    fn test_master_has_no_fallback() {
        let a = node("A", None);
        let b = node("B", None);
        let cluster = test_cluster(ClientPolicy::default(), vec![a.clone(), b.clone()]);
        let mut p = Partition::new(NS, 0, table(&[None, Some(&b)]), Replica::Master, false);

        let err = p.get_node_read(&cluster).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidNode);
        assert!(err.message().contains("test:0"));
    }

    #[test]
    fn test_master_proles_round_robin() {
        let a = node("A", None);
        let b = node("B", None);
        let cluster = test_cluster(ClientPolicy::default(), vec![a.clone(), b.clone()]);
        let mut p = Partition::new(
            NS,
            0,
            table(&[Some(&a), Some(&b)]),
            Replica::MasterProles,
            false,
        );

        let first = p.get_node_read(&cluster).unwrap();
        let second = p.get_node_read(&cluster).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(p.sequence(), 0);
    }

    #[test]
    fn test_random_uses_cluster() {
        let a = node("A", None);
        let cluster = test_cluster(ClientPolicy::default(), vec![a.clone()]);
        let mut p = Partition::new(NS, 0, table(&[None]), Replica::Random, false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));

        // writes ignore RANDOM and go to the master
        let err = p.get_node_write(&cluster).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidNode);
    }

    #[test]
    fn test_empty_cluster_error() {
        let a = node("A", None);
        a.set_inactive();
        let cluster = test_cluster(ClientPolicy::default(), vec![]);
        let mut p = Partition::new(NS, 0, table(&[Some(&a)]), Replica::Sequence, false);
        let err = p.get_node_read(&cluster).unwrap_err();
        assert!(err.is(&Error::CLUSTER_IS_EMPTY));
    }

    #[test]
    fn test_prefer_rack_skips_prev_node() {
        let a = node("A", Some(1));
        let b = node("B", Some(1));
        let policy = ClientPolicy::builder().rack_ids(vec![1]).build();
        let cluster = test_cluster(policy, vec![a.clone(), b.clone()]);
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::PreferRack, false);

        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));
        assert!(Arc::ptr_eq(&p.prev_node().unwrap(), &a));

        // retry: A is the previous node, B shares the rack
        p.prepare_retry_read(false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &b));
        assert!(Arc::ptr_eq(&p.prev_node().unwrap(), &b));

        // even without advancing the sequence, A is not picked again
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::PreferRack, false);
        p.prev_node = Arc::downgrade(&a);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &b));
        assert_eq!(p.sequence(), 1);
    }

    #[test]
    fn test_prefer_rack_falls_back() {
        let a = node("A", Some(2));
        let b = node("B", Some(3));
        let policy = ClientPolicy::builder().rack_ids(vec![1]).build();
        let cluster = test_cluster(policy, vec![a.clone(), b.clone()]);

        // no node on rack 1: first active node in sequence order
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::PreferRack, false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));

        // the previous node is the last resort
        let mut p = Partition::new(NS, 0, table(&[Some(&a), None]), Replica::PreferRack, false);
        p.prev_node = Arc::downgrade(&a);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));
    }

    #[test]
    fn test_prefer_rack_without_rack_ids_uses_sequence() {
        let a = node("A", Some(1));
        let b = node("B", Some(1));
        let cluster = test_cluster(ClientPolicy::default(), vec![a.clone(), b.clone()]);
        assert!(cluster.rack_ids().is_empty());

        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::PreferRack, false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &a));
        assert!(Arc::ptr_eq(&p.get_node_write(&cluster).unwrap(), &a));

        a.set_inactive();
        let mut p = Partition::new(NS, 0, table(&[Some(&a), Some(&b)]), Replica::PreferRack, false);
        assert!(Arc::ptr_eq(&p.get_node_read(&cluster).unwrap(), &b));
        assert_eq!(p.sequence(), 1);
    }

    #[test]
    fn test_sequence_exhaustion_reports_partition() {
        let a = node("A", Some(1));
        let b = node("B", Some(1));
        a.set_inactive();
        b.set_inactive();
        let policy = ClientPolicy::builder().rack_ids(vec![1]).build();
        let cluster = test_cluster(policy, vec![a.clone(), b.clone()]);

        let mut partitions = Partitions::new(PARTITIONS, 2, false);
        partitions.set_node(0, 777, a.clone());
        partitions.set_node(1, 777, b.clone());
        let partitions = Arc::new(partitions);

        for replica in [Replica::Sequence, Replica::PreferRack, Replica::Master] {
            let mut p = Partition::new(NS, 777, partitions.clone(), replica, false);
            let err = p.get_node_read(&cluster).unwrap_err();
            assert_eq!(err.code(), ResultCode::InvalidNode);
            assert!(err.message().contains("test:777"), "{}", err.message());
            assert!(err.message().contains("cluster size 2"));

            let err = p.get_node_write(&cluster).unwrap_err();
            assert!(err.message().contains("test:777"));
        }
    }

    #[test]
    fn test_sc_read_overrides() {
        let mut partitions = Partitions::new(PARTITIONS, 2, true);
        let a = node("A", None);
        partitions.set_node(0, 0, a);
        let mut map = PartitionMap::new();
        map.insert(NS.to_string(), partitions);
        let digest = [0u8; DIGEST_SIZE];

        let policy = BasePolicy {
            replica: Replica::PreferRack,
            read_mode_sc: ReadModeSC::Session,
            ..BasePolicy::default()
        };
        let p = Partition::for_read(&map, &policy, NS, &digest).unwrap();
        assert_eq!(p.replica(), Replica::Master);
        assert!(!p.linearize());

        let policy = BasePolicy {
            read_mode_sc: ReadModeSC::Linearize,
            ..policy
        };
        let p = Partition::for_read(&map, &policy, NS, &digest).unwrap();
        assert_eq!(p.replica(), Replica::Sequence);
        assert!(p.linearize());

        let policy = BasePolicy {
            read_mode_sc: ReadModeSC::AllowReplica,
            ..policy
        };
        let p = Partition::for_read(&map, &policy, NS, &digest).unwrap();
        assert_eq!(p.replica(), Replica::PreferRack);

        // writes never take the read overrides
        let p = Partition::for_write(&map, &policy, NS, &digest).unwrap();
        assert_eq!(p.replica(), Replica::PreferRack);
        assert!(!p.linearize());

        let err = Partition::for_write(&map, &policy, "missing", &digest).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidNamespace);
    }

    #[test]
    fn test_prepare_retry() {
        let partitions = Arc::new(Partitions::new(4, 2, true));

        let mut p = Partition::new(NS, 0, partitions.clone(), Replica::Sequence, true);
        p.prepare_retry_read(true);
        assert_eq!(p.sequence(), 0);
        p.prepare_retry_read(false);
        assert_eq!(p.sequence(), 1);

        let mut p = Partition::new(NS, 0, partitions.clone(), Replica::Sequence, false);
        p.prepare_retry_read(true);
        assert_eq!(p.sequence(), 1);

        let mut p = Partition::new(NS, 0, partitions, Replica::Sequence, false);
        p.prepare_retry_write(true);
        assert_eq!(p.sequence(), 0);
        p.prepare_retry_write(false);
        assert_eq!(p.sequence(), 1);
    }

    /// Brute-force reference for rack selection: the first rack id in configured
    /// order with an active non-previous owner on it, the lowest sequence offset
    /// within that rack
    fn expected_rack_pick(
        owners: &[Option<usize>],
        racks: &[i32],
        active: &[bool],
        rack_ids: &[i32],
        prev: Option<usize>,
    ) -> Option<usize> {
        for &rack in rack_ids {
            for owner in owners.iter().flatten() {
                if Some(*owner) != prev && racks[*owner] == rack && active[*owner] {
                    return Some(*owner);
                }
            }
        }
        for owner in owners.iter().flatten() {
            if Some(*owner) != prev && active[*owner] {
                return Some(*owner);
            }
        }
        owners
            .iter()
            .flatten()
            .find(|o| Some(**o) == prev && active[**o])
            .copied()
    }

    proptest! {
        #[test]
        fn test_multi_rack_order(
            racks in proptest::collection::vec(0i32..4, 4),
            active in proptest::collection::vec(any::<bool>(), 4),
            owners in proptest::collection::vec(proptest::option::of(0usize..4), 1..4),
            rack_ids in proptest::collection::vec(0i32..4, 1..4),
            prev in proptest::option::of(0usize..4),
        ) {
            let nodes: Vec<_> = (0..4)
                .map(|i| node(&format!("N{}", i), Some(racks[i])))
                .collect();
            for (i, n) in nodes.iter().enumerate() {
                if !active[i] {
                    n.set_inactive();
                }
            }

            let policy = ClientPolicy::builder().rack_ids(rack_ids.clone()).build();
            let cluster = test_cluster(policy, nodes.clone());
            let slots: Vec<_> = owners.iter().map(|o| o.map(|i| &nodes[i])).collect();
            let mut p = Partition::new(NS, 0, table(&slots), Replica::PreferRack, false);
            if let Some(prev) = prev {
                p.prev_node = Arc::downgrade(&nodes[prev]);
            }

            let expected = expected_rack_pick(&owners, &racks, &active, &rack_ids, prev);
            match (p.get_node_read(&cluster), expected) {
                (Ok(got), Some(want)) => {
                    prop_assert!(Arc::ptr_eq(&got, &nodes[want]));
                    prop_assert!(Arc::ptr_eq(&p.prev_node().unwrap(), &nodes[want]));
                }
                (Err(e), None) => prop_assert_eq!(e.code(), ResultCode::InvalidNode),
                (got, want) => prop_assert!(false, "got {:?}, want {:?}", got.map(|n| n.name().to_string()), want),
            }
        }
    }
}
