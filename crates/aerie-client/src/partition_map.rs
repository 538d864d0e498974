//! Partition ownership tables
//!
//! [`PartitionMap`] maps a namespace to its [`Partitions`] table. Both are
//! published as immutable snapshots: readers clone an `Arc` and never see a table
//! change under them, writers clone-on-write under the cluster merge lock and swap
//! the whole map in when done.

use crate::error::{Error, Result, ResultCode};
use crate::node::Node;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Partitions per namespace
pub const PARTITIONS: usize = 4096;

/// Owners of every partition of one namespace, per replica level
#[derive(Clone)]
pub struct Partitions {
    /// `replicas[level][partition]`, level 0 is the master
    replicas: Vec<Vec<Option<Arc<Node>>>>,
    sc_mode: bool,
    regimes: Vec<u32>,
    partition_count: usize,
}

impl Partitions {
    pub fn new(partition_count: usize, replica_count: usize, sc_mode: bool) -> Self {
        Self {
            replicas: vec![vec![None; partition_count]; replica_count],
            sc_mode,
            regimes: vec![0; partition_count],
            partition_count,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Replica levels, master included
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Namespace runs in strong-consistency mode
    pub fn sc_mode(&self) -> bool {
        self.sc_mode
    }

    /// Owner of `partition` at replica `level`
    pub fn node(&self, level: usize, partition: usize) -> Option<&Arc<Node>> {
        self.replicas.get(level)?.get(partition)?.as_ref()
    }

    pub fn master(&self, partition: usize) -> Option<&Arc<Node>> {
        self.node(0, partition)
    }

    pub fn regime(&self, partition: usize) -> u32 {
        self.regimes.get(partition).copied().unwrap_or(0)
    }

    /// Grow by appending empty levels or shrink by truncating. Existing levels are
    /// left alone.
    pub fn set_replica_count(&mut self, replica_count: usize) {
        let count = self.partition_count;
        self.replicas.resize_with(replica_count, || vec![None; count]);
    }

    /// Replace the owner of one slot, returning the previous owner
    pub(crate) fn set_node(
        &mut self,
        level: usize,
        partition: usize,
        node: Arc<Node>,
    ) -> Option<Arc<Node>> {
        self.replicas[level][partition].replace(node)
    }

    pub(crate) fn set_regime(&mut self, partition: usize, regime: u32) {
        self.regimes[partition] = regime;
    }

    /// Drop every reference to `node`
    pub(crate) fn remove_node(&mut self, node: &Arc<Node>) -> usize {
        let mut removed = 0;
        for slot in self.replicas.iter_mut().flatten() {
            if slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    fn mis_sized(&self) -> bool {
        self.regimes.len() != self.partition_count
            || self.replicas.iter().any(|r| r.len() != self.partition_count)
    }

    fn missing_masters(&self) -> usize {
        self.replicas
            .first()
            .map_or(self.partition_count, |m| m.iter().filter(|n| n.is_none()).count())
    }
}

impl fmt::Debug for Partitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partitions")
            .field("partition_count", &self.partition_count)
            .field("replica_count", &self.replicas.len())
            .field("sc_mode", &self.sc_mode)
            .finish()
    }
}

/// Namespace → partition table snapshot
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    namespaces: HashMap<String, Arc<Partitions>>,
}

impl PartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str) -> Option<&Arc<Partitions>> {
        self.namespaces.get(namespace)
    }

    pub(crate) fn get_mut(&mut self, namespace: &str) -> Option<&mut Arc<Partitions>> {
        self.namespaces.get_mut(namespace)
    }

    pub(crate) fn insert(&mut self, namespace: String, partitions: Partitions) {
        self.namespaces.insert(namespace, Arc::new(partitions));
    }

    /// Table for `namespace`, or the error a command should report
    pub fn partitions(&self, namespace: &str) -> Result<&Arc<Partitions>> {
        self.get(namespace)
            .ok_or_else(|| Error::invalid_namespace(namespace, self.len()))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Drop every reference to `node` from all tables
    pub(crate) fn remove_node(&mut self, node: &Arc<Node>) -> usize {
        self.namespaces
            .values_mut()
            .map(|p| {
                if p.replicas.iter().flatten().flatten().any(|n| Arc::ptr_eq(n, node)) {
                    Arc::make_mut(p).remove_node(node)
                } else {
                    0
                }
            })
            .sum()
    }

    /// Check table sizes and master coverage
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut names: Vec<_> = self.namespaces.keys().collect();
        names.sort();

        for name in names {
            let partitions = &self.namespaces[name];
            if partitions.mis_sized() {
                problems.push(format!("{}: replica or regime table has the wrong size", name));
                continue;
            }
            let missing = partitions.missing_masters();
            if missing > 0 {
                problems.push(format!("{}: {} partitions without a master", name, missing));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ResultCode::InvalidClusterPartitionMap,
                problems.join("; "),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_node;
    use crate::policy::ClientPolicy;
    use proptest::prelude::*;

    #[test]
    fn test_new_table_shape() {
        let p = Partitions::new(PARTITIONS, 2, true);
        assert_eq!(p.replica_count(), 2);
        assert_eq!(p.partition_count(), PARTITIONS);
        assert!(p.sc_mode());
        assert!(p.master(17).is_none());
        assert_eq!(p.regime(17), 0);
        assert!(p.node(5, 17).is_none());
    }

    #[test]
    fn test_remove_node_clears_slots() {
        let a = Arc::new(test_node("A", ClientPolicy::default()));
        let b = Arc::new(test_node("B", ClientPolicy::default()));
        let mut p = Partitions::new(8, 2, false);
        p.set_node(0, 1, a.clone());
        p.set_node(1, 1, b.clone());
        p.set_node(0, 2, a.clone());

        let mut map = PartitionMap::new();
        map.insert("test".to_string(), p);
        let snapshot = map.clone();

        assert_eq!(map.remove_node(&a), 2);
        let p = map.get("test").unwrap();
        assert!(p.master(1).is_none());
        assert!(Arc::ptr_eq(p.node(1, 1).unwrap(), &b));

        // the old snapshot is untouched
        assert!(Arc::ptr_eq(snapshot.get("test").unwrap().master(1).unwrap(), &a));
    }

    #[test]
    fn test_partitions_lookup_errors() {
        let map = PartitionMap::new();
        let err = map.partitions("test").unwrap_err();
        assert_eq!(err.message(), "partition map empty");

        let mut map = PartitionMap::new();
        map.insert("bar".to_string(), Partitions::new(8, 1, false));
        let err = map.partitions("test").unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidNamespace);
        assert!(err.message().contains("test"));
    }

    #[test]
    fn test_validate() {
        let a = Arc::new(test_node("A", ClientPolicy::default()));
        let mut p = Partitions::new(4, 1, false);
        for i in 0..4 {
            p.set_node(0, i, a.clone());
        }
        let mut map = PartitionMap::new();
        map.insert("test".to_string(), p);
        assert!(map.validate().is_ok());

        map.insert("bar".to_string(), Partitions::new(4, 1, false));
        let err = map.validate().unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidClusterPartitionMap);
        assert!(err.message().contains("bar: 4 partitions without a master"));
    }

    proptest! {
        /// Resizing keeps the surviving levels untouched and adds empty ones
        #[test]
        fn test_resize_preserves_owners(
            initial in 1usize..5,
            target in 0usize..8,
            owned in proptest::collection::vec((0usize..5, 0usize..16), 0..40),
        ) {
            let node = Arc::new(test_node("A", ClientPolicy::default()));
            let mut p = Partitions::new(16, initial, false);
            for (level, partition) in owned {
                if level < initial {
                    p.set_node(level, partition, node.clone());
                }
            }
            let before = p.clone();

            p.set_replica_count(target);
            prop_assert_eq!(p.replica_count(), target);
            for level in 0..target {
                for partition in 0..16 {
                    let expected = if level < initial {
                        before.node(level, partition).is_some()
                    } else {
                        false
                    };
                    prop_assert_eq!(p.node(level, partition).is_some(), expected);
                }
            }
            prop_assert_eq!(p.regimes.len(), 16);
        }
    }
}
