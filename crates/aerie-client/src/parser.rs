//! Partition map wire parser
//!
//! A node announces which partitions it owns as an info reply:
//!
//! ```text
//! partition-generation\t<generation>\n
//! replicas\t<ns>:<regime>,<count>,<bitmap>,...;<ns>:...\n
//! ```
//!
//! `replicas-all` is the older form of the same value without the regime field.
//! Namespace segments end with `;` or a newline. Every bitmap is base64 and holds
//! one bit per partition, most significant bit first.
//!
//! Parsing is split in two: [`PartitionParser::parse`] validates the whole reply
//! without touching any shared state, [`PartitionParser::merge`] then applies it to
//! a partition map and cannot fail. A malformed reply therefore never leaves a
//! half-applied map behind.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::partition_map::{PartitionMap, Partitions};
use base64::Engine;
use std::sync::Arc;
use tracing::{info, warn};

const PARTITION_GENERATION: &str = "partition-generation";
const REPLICAS: &str = "replicas";
const REPLICAS_ALL: &str = "replicas-all";

const MAX_NAMESPACE_LEN: usize = 31;
const MAX_SNIPPET_LEN: usize = 200;

/// Ownership announced for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceReplicas {
    pub namespace: String,
    /// Zero when the reply carries no regime
    pub regime: u32,
    /// Decoded bitmap per replica level
    pub bitmaps: Vec<Vec<u8>>,
}

impl NamespaceReplicas {
    pub fn replica_count(&self) -> usize {
        self.bitmaps.len()
    }

    /// Whether the bitmap of `level` has the bit of `partition` set
    pub fn owns(&self, level: usize, partition: usize) -> bool {
        self.bitmaps
            .get(level)
            .and_then(|b| b.get(partition >> 3))
            .is_some_and(|byte| byte & (0x80 >> (partition & 7)) != 0)
    }
}

/// A fully validated partition map reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdate {
    pub generation: i64,
    pub namespaces: Vec<NamespaceReplicas>,
}

/// What a merge changed
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Nodes that lost a partition to the announcing node
    pub previous_owners: Vec<Arc<Node>>,
    /// Slots whose owner changed
    pub changed: usize,
    /// Slots skipped because the stored regime was newer
    pub stale_regimes: usize,
}

/// Parser for partition map replies
#[derive(Debug, Clone, Copy)]
pub struct PartitionParser {
    partition_count: usize,
}

impl PartitionParser {
    pub fn new(partition_count: usize) -> Self {
        Self { partition_count }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Validate and decode a raw reply
    pub fn parse(&self, raw: &str) -> Result<PartitionUpdate> {
        if raw.is_empty() {
            return Err(Error::parse("partition info is empty"));
        }

        let rest = expect_name(raw, PARTITION_GENERATION)
            .ok_or_else(|| parse_error(format!("expected {}", PARTITION_GENERATION), raw))?;
        let (generation, rest) = rest
            .split_once('\n')
            .ok_or_else(|| parse_error("failed to find partition-generation value".to_string(), raw))?;
        let generation: i64 = generation.trim().parse().map_err(|_| {
            parse_error(format!("invalid partition-generation `{}`", generation.trim()), raw)
        })?;

        let (with_regime, body) = if let Some(body) = expect_name(rest, REPLICAS) {
            (true, body)
        } else if let Some(body) = expect_name(rest, REPLICAS_ALL) {
            (false, body)
        } else {
            return Err(parse_error(
                format!("expected {} or {}", REPLICAS, REPLICAS_ALL),
                raw,
            ));
        };

        let namespaces = body
            .split(|c| c == ';' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|segment| self.parse_namespace(segment, with_regime, raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(PartitionUpdate {
            generation,
            namespaces,
        })
    }

    fn parse_namespace(&self, segment: &str, with_regime: bool, raw: &str) -> Result<NamespaceReplicas> {
        let (namespace, fields) = segment
            .split_once(':')
            .ok_or_else(|| parse_error(format!("invalid partition segment `{}`", segment), raw))?;
        let namespace = namespace.trim();
        if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
            return Err(parse_error(
                format!("invalid partition namespace `{}`", namespace),
                raw,
            ));
        }

        let mut fields = fields.split(',').map(str::trim);
        let regime = if with_regime {
            parse_number(fields.next(), "regime", namespace, raw)?
        } else {
            0
        };
        let replica_count = parse_number(fields.next(), "replica count", namespace, raw)? as usize;

        let min_len = self.partition_count.div_ceil(8);
        let mut bitmaps = Vec::with_capacity(replica_count.min(8));
        for level in 0..replica_count {
            let encoded = fields.next().filter(|s| !s.is_empty()).ok_or_else(|| {
                parse_error(
                    format!("empty partition bitmap {} for namespace `{}`", level, namespace),
                    raw,
                )
            })?;
            let bitmap = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    parse_error(
                        format!("invalid partition bitmap for namespace `{}`: {}", namespace, e),
                        raw,
                    )
                })?;
            if bitmap.len() < min_len {
                return Err(parse_error(
                    format!(
                        "partition bitmap for namespace `{}` has {} bytes, expected {}",
                        namespace,
                        bitmap.len(),
                        min_len
                    ),
                    raw,
                ));
            }
            bitmaps.push(bitmap);
        }

        if fields.next().is_some() {
            return Err(parse_error(
                format!("more bitmaps than replicas for namespace `{}`", namespace),
                raw,
            ));
        }

        Ok(NamespaceReplicas {
            namespace: namespace.to_string(),
            regime,
            bitmaps,
        })
    }

    /// Apply an update announced by `node`.
    ///
    /// A set bit makes `node` the owner of the slot unless the stored regime is
    /// newer. A newer regime is recorded, an equal one only takes ownership. Tables
    /// shared with readers are copied before they change.
    pub fn merge(&self, update: &PartitionUpdate, map: &mut PartitionMap, node: &Arc<Node>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for ns in &update.namespaces {
            let replica_count = ns.replica_count();
            if map.get(&ns.namespace).is_none() {
                map.insert(
                    ns.namespace.clone(),
                    Partitions::new(self.partition_count, replica_count, ns.regime != 0),
                );
            }
            let Some(table) = map.get_mut(&ns.namespace) else {
                continue;
            };

            if table.replica_count() != replica_count {
                info!(
                    "Namespace {} replication factor changed from {} to {}",
                    ns.namespace,
                    table.replica_count(),
                    replica_count
                );
                Arc::make_mut(table).set_replica_count(replica_count);
            }

            for level in 0..replica_count {
                for partition in 0..table.partition_count() {
                    if !ns.owns(level, partition) {
                        continue;
                    }

                    let stored = table.regime(partition);
                    if ns.regime < stored {
                        if outcome.stale_regimes == 0 {
                            warn!(
                                "Node {} regime {} is older than stored regime {} for {}:{}",
                                node, ns.regime, stored, ns.namespace, partition
                            );
                        }
                        outcome.stale_regimes += 1;
                        continue;
                    }

                    let same_owner = table
                        .node(level, partition)
                        .is_some_and(|n| Arc::ptr_eq(n, node));
                    if ns.regime > stored {
                        Arc::make_mut(table).set_regime(partition, ns.regime);
                    }
                    if same_owner {
                        continue;
                    }

                    let previous = Arc::make_mut(table).set_node(level, partition, node.clone());
                    outcome.changed += 1;
                    if let Some(previous) = previous {
                        if !outcome
                            .previous_owners
                            .iter()
                            .any(|n| Arc::ptr_eq(n, &previous))
                        {
                            outcome.previous_owners.push(previous);
                        }
                    }
                }
            }
        }

        outcome
    }
}

fn expect_name<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    s.strip_prefix(name)?.strip_prefix('\t')
}

fn parse_number(field: Option<&str>, what: &str, namespace: &str, raw: &str) -> Result<u32> {
    let field = field.unwrap_or_default();
    field.parse().map_err(|_| {
        parse_error(
            format!("invalid {} `{}` for namespace `{}`", what, field, namespace),
            raw,
        )
    })
}

fn parse_error(message: String, raw: &str) -> Error {
    let snippet: String = raw.chars().take(MAX_SNIPPET_LEN).collect();
    let ellipsis = if raw.chars().nth(MAX_SNIPPET_LEN).is_some() {
        "..."
    } else {
        ""
    };
    Error::parse(format!("{}, response: `{}{}`", message, snippet, ellipsis))
}
