//! Error types for the provenance query server
//!
//! Query and continuation errors are scoped to one session or one boundary
//! vertex; server errors are fatal to startup only.

use thiserror::Error;

use provenance_graph::GraphError;

/// Errors reported back to the issuing session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Query text could not be parsed
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Requested traversal depth exceeds the configured maximum
    #[error("depth {requested} exceeds maximum traversal depth {max}")]
    DepthExceeded { requested: u32, max: u32 },
}

impl QueryError {
    pub fn syntax(message: impl Into<String>) -> Self {
        QueryError::Syntax(message.into())
    }

    /// Short label used in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Syntax(_) => "syntax",
            QueryError::DepthExceeded { .. } => "depth",
        }
    }
}

/// Failures of a single remote continuation. Each one degrades the query to a
/// partial result; none is fatal.
#[derive(Error, Debug)]
pub enum ContinuationError {
    /// Peer could not be connected to
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    /// Peer did not answer within the continuation timeout
    #[error("peer {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    /// Peer answered with an error line
    #[error("peer {peer} reported an error: {message}")]
    Peer { peer: String, message: String },

    /// Peer answered with something that is not a result stream
    #[error("protocol error from peer {peer}: {reason}")]
    Protocol { peer: String, reason: String },

    /// The vertex does not describe a reachable remote host
    #[error("vertex {0} is not a resolvable boundary")]
    NotABoundary(String),
}

/// A response block that could not be turned back into a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The responder reported an error line
    #[error("remote error: {0}")]
    Remote(String),

    /// The block is not a well-formed result
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Seed file could not be loaded
    #[error("Failed to load seed file {path}: {reason}")]
    Seed { path: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Server result type
pub type ServerResult<T> = Result<T, ServerError>;
