//! Aerie Info Protocol
//!
//! This crate defines the textual info protocol spoken between the Aerie client and
//! server nodes for identity, capability and topology discovery, plus the `Host`
//! address type shared by seeds and service announcements.
//!
//! # Example
//!
//! ```rust
//! use aerie_protocol::info;
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! info::encode_request(&["node", "partition-generation"], &mut buf);
//! assert_eq!(buf.len(), info::HEADER_SIZE + 26);
//!
//! let map = info::parse_response("node\tA1\npartition-generation\t3\n");
//! assert_eq!(map["partition-generation"], "3");
//! ```

mod error;
pub mod host;
pub mod info;

pub use error::{ProtocolError, Result};
pub use host::{parse_hosts, Host, DEFAULT_PORT};
