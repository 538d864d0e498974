//! Seed validation
//!
//! Turns a seed address into a named, feature-checked node. The seed is resolved
//! to its aliases and each alias is tried in turn until one answers as a healthy
//! cluster member. When the seed sits behind a load balancer the node's own
//! advertised address is used instead of the seed.

use crate::auth::SessionInfo;
use crate::connection::{Connection, Connector};
use crate::error::{Error, Result, ResultCode};
use crate::node::{FEATURE_PARTITION_SCAN, FEATURE_QUERY_SHOW};
use aerie_protocol::{parse_hosts, Host};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A seed that answered as a cluster node
#[derive(Debug)]
pub struct ValidatedNode {
    pub name: String,
    /// Address commands will use
    pub primary_host: Host,
    pub aliases: Vec<Host>,
    pub features: u32,
    pub session: Option<SessionInfo>,
    /// Connection the node was validated on, reused for tending
    pub(crate) conn: Option<Connection>,
}

/// Validates seeds against the cluster policy
#[derive(Debug, Clone)]
pub struct NodeValidator {
    connector: Connector,
}

impl NodeValidator {
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    /// Validate every seed concurrently. Seeds that resolve to the same node are
    /// reported once. Fails only when no seed could be validated.
    pub async fn seed_nodes(&self, seeds: &[Host]) -> Result<Vec<ValidatedNode>> {
        info!("Seeding the cluster. Seeds count: {}", seeds.len());

        let found: Arc<DashMap<String, ValidatedNode>> = Arc::new(DashMap::new());
        let mut tasks = JoinSet::new();
        for seed in seeds {
            let validator = self.clone();
            let seed = seed.clone();
            let found = found.clone();
            tasks.spawn(async move {
                let validated = validator.validate(&seed).await;
                match validated {
                    Ok(node) => {
                        debug!("Seed {} is node {}", seed, node.name);
                        found.entry(node.name.clone()).or_insert(node);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Seed {} failed: {}", seed, e);
                        Err(e)
                    }
                }
            });
        }

        let mut errors: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(Error::wrap(ResultCode::CommonError, e)));
            if let Err(e) = result {
                errors = Some(e.chain(errors));
            }
        }

        let nodes: Vec<ValidatedNode> = match Arc::try_unwrap(found) {
            Ok(map) => map.into_iter().map(|(_, node)| node).collect(),
            Err(shared) => {
                let names: Vec<String> = shared.iter().map(|e| e.key().clone()).collect();
                names
                    .iter()
                    .filter_map(|name| shared.remove(name).map(|(_, node)| node))
                    .collect()
            }
        };

        if nodes.is_empty() {
            let hosts: Vec<String> = seeds.iter().map(Host::to_string).collect();
            return Err(Error::new(
                ResultCode::InvalidNode,
                format!("failed to connect to hosts: [{}]", hosts.join(", ")),
            )
            .chain(errors));
        }
        Ok(nodes)
    }

    /// Resolve `seed` and validate its aliases until one succeeds
    pub async fn validate(&self, seed: &Host) -> Result<ValidatedNode> {
        let (aliases, detect_lb) = resolve_aliases(seed).await?;
        let detect_lb = detect_lb && self.connector.policy().detect_load_balancer;

        let mut errors: Option<Error> = None;
        for alias in &aliases {
            match self.validate_alias(alias, &aliases, detect_lb).await {
                Ok(node) => return Ok(node),
                Err(e) => {
                    debug!("Alias {} failed: {}", alias, e);
                    errors = Some(e.chain(errors));
                }
            }
        }

        Err(errors.unwrap_or_else(|| {
            Error::new(
                ResultCode::InvalidNode,
                format!("no addresses found for host {}", seed),
            )
        }))
    }

    async fn validate_alias(&self, alias: &Host, aliases: &[Host], detect_lb: bool) -> Result<ValidatedNode> {
        let policy = self.connector.policy();
        let (mut conn, session) = self.connector.open(alias).await?;

        let mut names = vec!["node", "partition-generation", "features"];
        if policy.cluster_name.is_some() {
            names.push("cluster-name");
        }
        let address_command = if policy.use_services_alternate {
            "service-clear-alt"
        } else {
            "service-clear-std"
        };
        if detect_lb {
            names.push(address_command);
        }

        let map = match conn.request_info(&names).await {
            Ok(map) => map,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        let checked = self.check_identity(alias, &map);
        let (name, features) = match checked {
            Ok(ok) => ok,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        let mut validated = ValidatedNode {
            name,
            primary_host: alias.clone(),
            aliases: aliases.to_vec(),
            features,
            session,
            conn: Some(conn),
        };

        if detect_lb {
            let advertised = map.get(address_command).map(String::as_str).unwrap_or_default();
            self.follow_load_balancer(&mut validated, advertised).await;
        }

        Ok(validated)
    }

    /// Check name, generation, cluster name and features of an info reply
    fn check_identity(&self, alias: &Host, map: &HashMap<String, String>) -> Result<(String, u32)> {
        let name = match map.get("node").map(String::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(Error::new(
                    ResultCode::InvalidNode,
                    format!("host {} did not return a node name", alias),
                ))
            }
        };

        let generation = map
            .get("partition-generation")
            .and_then(|g| g.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                Error::new(
                    ResultCode::InvalidNode,
                    format!("node {} {} returned an invalid partition-generation", name, alias),
                )
            })?;
        if generation < 0 {
            return Err(Error::new(
                ResultCode::InvalidNode,
                format!("node {} {} is not yet fully initialized", name, alias),
            ));
        }

        if let Some(expected) = &self.connector.policy().cluster_name {
            let actual = map.get("cluster-name").map(String::as_str).unwrap_or_default();
            if actual != expected {
                return Err(Error::new(
                    ResultCode::ClusterNameMismatch,
                    format!(
                        "node {} {} expected cluster name `{}` but received `{}`",
                        name, alias, expected, actual
                    ),
                ));
            }
        }

        let features = parse_features(map.get("features").map(String::as_str).unwrap_or_default())
            .map_err(|e| e.with_node(&format!("{} {}", name, alias)))?;
        Ok((name, features))
    }

    /// When none of the advertised addresses is one of the seed's aliases, the seed
    /// is a load balancer: switch to the first advertised address that answers with
    /// the same node name.
    async fn follow_load_balancer(&self, validated: &mut ValidatedNode, advertised: &str) {
        let hosts = match parse_hosts(advertised) {
            Ok(hosts) => hosts,
            Err(e) => {
                debug!("Ignoring advertised addresses of node {}: {}", validated.name, e);
                return;
            }
        };
        if hosts.is_empty()
            || hosts
                .iter()
                .any(|h| validated.aliases.iter().any(|a| a.same_address(h)))
        {
            return;
        }

        let tls_name = validated.primary_host.tls_name.clone();
        for host in hosts {
            let host = match &tls_name {
                Some(tls) => host.with_tls_name(tls.clone()),
                None => host,
            };

            let opened = self.connector.open(&host).await;
            let (mut conn, session) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    debug!("Advertised address {} failed: {}", host, e);
                    continue;
                }
            };

            let name = conn.request_info(&["node"]).await.ok().and_then(|mut m| m.remove("node"));
            if name.as_deref() == Some(validated.name.as_str()) {
                info!(
                    "Host {} is a load balancer, connected to node {} using address {}",
                    validated.primary_host, validated.name, host
                );
                if let Some(mut old) = validated.conn.replace(conn) {
                    old.close();
                }
                if session.is_some() {
                    validated.session = session;
                }
                validated.aliases = vec![host.clone()];
                validated.primary_host = host;
                return;
            }
            conn.close();
        }

        warn!(
            "Unable to connect to any advertised address of node {}, using seed {}",
            validated.name, validated.primary_host
        );
    }
}

/// Parse a `features` reply into a capability mask. Partition scans are required.
pub fn parse_features(features: &str) -> Result<u32> {
    let mask = features
        .split(';')
        .map(str::trim)
        .fold(0, |mask, feature| match feature {
            "pscans" => mask | FEATURE_PARTITION_SCAN,
            "query-show" => mask | FEATURE_QUERY_SHOW,
            _ => mask,
        });

    if mask & FEATURE_PARTITION_SCAN == 0 {
        return Err(Error::new(
            ResultCode::UnsupportedFeature,
            "node does not support partition scans, the server version is too old",
        ));
    }
    Ok(mask)
}

/// Resolve a seed to its aliases. IP literals skip DNS. Load balancer detection is
/// off for loopback literals.
pub async fn resolve_aliases(seed: &Host) -> Result<(Vec<Host>, bool)> {
    if let Ok(ip) = seed.name.parse::<IpAddr>() {
        return Ok((vec![seed.clone()], !ip.is_loopback()));
    }

    let addrs = tokio::net::lookup_host((seed.name.as_str(), seed.port))
        .await
        .map_err(|e| {
            Error::wrap(ResultCode::InvalidNode, e).with_node(seed)
        })?;

    let mut aliases: Vec<Host> = Vec::new();
    for addr in addrs {
        let mut alias = Host::new(addr.ip().to_string(), addr.port());
        alias.tls_name = seed.tls_name.clone();
        if !aliases.iter().any(|a| a.same_address(&alias)) {
            aliases.push(alias);
        }
    }

    if aliases.is_empty() {
        return Err(Error::new(
            ResultCode::InvalidNode,
            format!("failed to find addresses for host {}", seed),
        ));
    }
    Ok((aliases, true))
}
