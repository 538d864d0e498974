//! Client error types
//!
//! Every failure surfaces as one structured [`Error`]: a [`ResultCode`], a message,
//! the low-level cause (if any), the node the attempt ran against, the retry
//! iteration and whether a write may have been applied (`in_doubt`). Errors of
//! earlier attempts hang off [`Error::previous`] so the whole retry history of an
//! operation survives to the caller.

use aerie_protocol::ProtocolError;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result codes. Negative values are produced on the client side; their outcome on
/// the server is unclear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    NetworkError = -18,
    CommonError = -17,
    MaxRetriesExceeded = -16,
    MaxErrorRate = -15,
    RackNotDefined = -13,
    InvalidClusterPartitionMap = -12,
    ServerNotAvailable = -11,
    ClusterNameMismatch = -10,
    NoAvailableConnectionsToNode = -8,
    TypeNotSupported = -7,
    CommandRejected = -6,
    InvalidNode = -3,
    ParseError = -2,
    SerializeError = -1,
    Ok = 0,
    ServerError = 1,
    ParameterError = 4,
    Timeout = 9,
    UnsupportedFeature = 16,
    DeviceOverload = 18,
    InvalidNamespace = 20,
    NotAuthenticated = 80,
}

impl ResultCode {
    /// Map a code returned by a server. Unknown codes collapse to `ServerError`.
    pub fn from_server(code: i32) -> Self {
        match code {
            0 => ResultCode::Ok,
            4 => ResultCode::ParameterError,
            9 => ResultCode::Timeout,
            16 => ResultCode::UnsupportedFeature,
            18 => ResultCode::DeviceOverload,
            20 => ResultCode::InvalidNamespace,
            80 => ResultCode::NotAuthenticated,
            _ => ResultCode::ServerError,
        }
    }

    /// Numeric value of the code
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Client-side code, the server may or may not have seen the request
    pub fn is_unclear(self) -> bool {
        self.value() < 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::NetworkError => "Network error",
            ResultCode::CommonError => "Common error",
            ResultCode::MaxRetriesExceeded => "Max retries exceeded",
            ResultCode::MaxErrorRate => "Max error rate exceeded",
            ResultCode::RackNotDefined => "Rack not defined",
            ResultCode::InvalidClusterPartitionMap => "Invalid cluster partition map",
            ResultCode::ServerNotAvailable => "Server not available",
            ResultCode::ClusterNameMismatch => "Cluster name does not match the ClientPolicy.cluster_name value",
            ResultCode::NoAvailableConnectionsToNode => "No available connections to the node",
            ResultCode::TypeNotSupported => "Type cannot be converted",
            ResultCode::CommandRejected => "Command rejected",
            ResultCode::InvalidNode => "Invalid node",
            ResultCode::ParseError => "Parse error",
            ResultCode::SerializeError => "Serialize error",
            ResultCode::Ok => "ok",
            ResultCode::ServerError => "Server error",
            ResultCode::ParameterError => "Parameter error",
            ResultCode::Timeout => "Timeout",
            ResultCode::UnsupportedFeature => "Unsupported server feature",
            ResultCode::DeviceOverload => "Device overload",
            ResultCode::InvalidNamespace => "Namespace not found",
            ResultCode::NotAuthenticated => "Not authenticated",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.value())
    }
}

/// A pre-built error for a recurring condition.
///
/// `err()` hands out a fresh [`Error`] that can be annotated freely; [`Error::is`]
/// recognizes errors minted from the same constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstError {
    code: ResultCode,
    message: &'static str,
}

impl ConstError {
    pub const fn new(code: ResultCode, message: &'static str) -> Self {
        Self { code, message }
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    /// A fresh, owned copy of this error
    pub fn err(&self) -> Error {
        Error::new(self.code, self.message)
    }
}

/// Boxed low-level cause
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured client error
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct Error {
    code: ResultCode,
    message: Cow<'static, str>,
    #[source]
    cause: Option<BoxError>,
    node: Option<String>,
    in_doubt: bool,
    iteration: usize,
    previous: Option<Box<Error>>,
}

impl Error {
    pub const SERVER_NOT_AVAILABLE: ConstError =
        ConstError::new(ResultCode::ServerNotAvailable, "server is not accepting requests");
    pub const INVALID_PARTITION_MAP: ConstError = ConstError::new(
        ResultCode::InvalidClusterPartitionMap,
        "partition map errors normally occur when the cluster has partitioned due to network anomaly or node crash, or is not configured properly",
    );
    pub const CONNECTION_POOL_EMPTY: ConstError = ConstError::new(
        ResultCode::NoAvailableConnectionsToNode,
        "connection pool is empty: all connections are in use, or none were available",
    );
    pub const CONNECTION_POOL_EXHAUSTED: ConstError = ConstError::new(
        ResultCode::NoAvailableConnectionsToNode,
        "connection pool is exhausted: all connections are in use and opening more is not allowed by connection_queue_size",
    );
    pub const TOO_MANY_CONNECTIONS_FOR_NODE: ConstError = ConstError::new(
        ResultCode::NoAvailableConnectionsToNode,
        "connection limit reached for this node, see ClientPolicy.limit_connections_to_queue_size",
    );
    pub const TOO_MANY_OPENING_CONNECTIONS: ConstError = ConstError::new(
        ResultCode::NoAvailableConnectionsToNode,
        "too many connections are opening at once, see ClientPolicy.opening_connection_threshold",
    );
    pub const TIMEOUT: ConstError = ConstError::new(
        ResultCode::Timeout,
        "command execution timed out on client, see BasePolicy.total_timeout",
    );
    pub const NETWORK_TIMEOUT: ConstError =
        ConstError::new(ResultCode::Timeout, "network timeout");
    pub const MAX_RETRIES_EXCEEDED: ConstError = ConstError::new(
        ResultCode::MaxRetriesExceeded,
        "command execution exceeded the number of retries, see BasePolicy.max_retries",
    );
    pub const CLUSTER_IS_EMPTY: ConstError =
        ConstError::new(ResultCode::InvalidNode, "cluster is empty");
    pub const NOT_AUTHENTICATED: ConstError =
        ConstError::new(ResultCode::NotAuthenticated, "not authenticated");
    pub const MAX_ERROR_RATE: ConstError = ConstError::new(
        ResultCode::MaxErrorRate,
        "node error rate exceeded, see ClientPolicy.max_error_rate",
    );

    /// Create an error with a custom message
    pub fn new(code: ResultCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            node: None,
            in_doubt: false,
            iteration: 0,
            previous: None,
        }
    }

    /// Create an error whose message is the code description
    pub fn from_code(code: ResultCode) -> Self {
        Self::new(code, code.as_str())
    }

    /// Wrap a low-level error under a result code
    pub fn wrap(code: ResultCode, cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        Self::new(code, cause.to_string()).with_cause(cause)
    }

    pub fn parse(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ResultCode::ParseError, message)
    }

    pub fn parameter(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ResultCode::ParameterError, message)
    }

    /// No live node owns the partition. An empty cluster reports `CLUSTER_IS_EMPTY`.
    pub fn invalid_node(cluster_size: usize, partition: &impl fmt::Display) -> Self {
        if cluster_size == 0 {
            return Self::CLUSTER_IS_EMPTY.err();
        }
        Self::new(
            ResultCode::InvalidNode,
            format!(
                "node not found for partition {} in partition table (cluster size {})",
                partition, cluster_size
            ),
        )
    }

    /// The namespace is missing from the partition map
    pub fn invalid_namespace(namespace: &str, map_size: usize) -> Self {
        let message = if map_size == 0 {
            "partition map empty".to_string()
        } else {
            format!("namespace not found in partition map: {}", namespace)
        };
        Self::new(ResultCode::InvalidNamespace, message)
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Record the node the failing attempt ran against
    pub fn with_node(mut self, node: &impl fmt::Display) -> Self {
        self.node = Some(node.to_string());
        self
    }

    /// Record the retry iteration
    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    /// Mark a write as in doubt when the server may have applied it: more than one
    /// attempt was sent, or exactly one was sent and it ended in a timeout or a
    /// client-side code.
    pub fn set_in_doubt(mut self, is_read: bool, command_sent_counter: usize) -> Self {
        if !is_read
            && (command_sent_counter > 1
                || (command_sent_counter == 1
                    && (self.code == ResultCode::Timeout || self.code.is_unclear())))
        {
            self.in_doubt = true;
        }
        self
    }

    /// Put this error in front of the errors of earlier attempts
    pub fn chain(mut self, previous: Option<Error>) -> Self {
        if let Some(previous) = previous {
            self.previous = Some(Box::new(match self.previous.take() {
                Some(p) => p.chain(Some(previous)),
                None => previous,
            }));
        }
        self
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn in_doubt(&self) -> bool {
        self.in_doubt
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Error of the previous attempt, if any
    pub fn previous(&self) -> Option<&Error> {
        self.previous.as_deref()
    }

    /// Detach the errors of earlier attempts
    pub(crate) fn take_previous(&mut self) -> Option<Error> {
        self.previous.take().map(|p| *p)
    }

    /// This error followed by the errors of all earlier attempts
    pub fn attempts(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |e| e.previous())
    }

    /// Whether this error has the given result code
    pub fn matches(&self, code: ResultCode) -> bool {
        self.code == code
    }

    /// Whether this error was minted from `constant`
    pub fn is(&self, constant: &ConstError) -> bool {
        self.code == constant.code && self.message == constant.message
    }

    /// A socket or client timeout
    pub fn is_network_error(&self) -> bool {
        matches!(self.code, ResultCode::NetworkError) || self.is_client_timeout()
    }

    /// Timed out on the client side (as opposed to a timeout reported by the server)
    pub fn is_client_timeout(&self) -> bool {
        self.is(&Self::TIMEOUT) || self.is(&Self::NETWORK_TIMEOUT)
    }

    /// Check if this error is retriable on another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code,
            ResultCode::NetworkError
                | ResultCode::Timeout
                | ResultCode::ServerNotAvailable
                | ResultCode::NoAvailableConnectionsToNode
                | ResultCode::InvalidNode
                | ResultCode::DeviceOverload
                | ResultCode::MaxErrorRate
        )
    }

    /// One line per attempt, newest first
    pub fn trace(&self) -> String {
        self.attempts()
            .map(|e| {
                format!(
                    "ResultCode: {}, Iteration: {}, InDoubt: {}, Node: {}: {}",
                    e.code,
                    e.iteration,
                    e.in_doubt,
                    e.node.as_deref().unwrap_or("<none>"),
                    e.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// Long retry chains are unlinked one attempt at a time.
impl Drop for Error {
    fn drop(&mut self) {
        let mut next = self.previous.take();
        while let Some(mut e) = next {
            next = e.previous.take();
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::NETWORK_TIMEOUT.err().with_cause(e)
            }
            _ => Error::wrap(ResultCode::NetworkError, e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::NETWORK_TIMEOUT.err().with_cause(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::wrap(ResultCode::ParseError, e)
    }
}
