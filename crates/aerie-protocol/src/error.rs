//! Protocol error types

use thiserror::Error;

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    /// Message too large
    #[error("Message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// Header carries a version/type pair this client does not speak
    #[error("Unsupported protocol header: version {version}, type {msg_type}")]
    UnsupportedVersion { version: u8, msg_type: u8 },

    /// A host specification could not be parsed
    #[error("Invalid host: {0}")]
    InvalidHost(String),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
