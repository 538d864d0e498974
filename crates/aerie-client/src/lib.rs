//! # aerie-client
//!
//! Cluster-aware routing and connection management for the Aerie database.
//!
//! ## Features
//!
//! - **Seeding**: seeds are resolved, validated and de-duplicated by node name,
//!   including seeds that sit behind a load balancer
//! - **Partition Map**: per-namespace replica tables merged from node replies and
//!   published as immutable snapshots
//! - **Replica Selection**: sequence, rack-aware, master, master/prole round robin
//!   and random routing, with strong-consistency read overrides
//! - **Connection Pooling**: sharded ring-buffer pools per node
//! - **Retries**: one structured error per command with the full attempt chain and
//!   in-doubt tracking for writes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aerie_client::{BasePolicy, ClientPolicy, Cluster, Host, Partition};
//!
//! let policy = ClientPolicy::builder()
//!     .cluster_name("prod")
//!     .rack_ids(vec![1])
//!     .build();
//! let cluster = Cluster::new(policy, vec![Host::new("10.0.0.1", 3000)])?;
//! cluster.connect().await?;
//!
//! // route a read for a key digest
//! let map = cluster.partitions();
//! let mut partition = Partition::for_read(&map, &BasePolicy::default(), "test", &digest)?;
//! let node = partition.get_node_read(&cluster)?;
//! ```

pub mod auth;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod error;
pub mod node;
pub mod parser;
pub mod partition;
pub mod partition_map;
pub mod policy;
pub mod pool;
pub mod validator;

pub use aerie_protocol::Host;
pub use auth::{Authenticator, Credentials, SessionInfo};
pub use cluster::{Cluster, ClusterStats};
pub use command::Command;
pub use connection::{Connection, Connector};
pub use error::{ConstError, Error, Result, ResultCode};
pub use node::{Node, NodeStats};
pub use parser::{PartitionParser, PartitionUpdate};
pub use partition::{partition_id_for, Partition, DIGEST_SIZE};
pub use partition_map::{PartitionMap, Partitions, PARTITIONS};
pub use policy::{BasePolicy, ClientPolicy, ClientPolicyBuilder, ReadModeSC, Replica};
pub use pool::ConnectionHeap;
pub use validator::{NodeValidator, ValidatedNode};
