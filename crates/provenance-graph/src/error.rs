//! Error types for the provenance graph core

use thiserror::Error;

/// Base error type for entity construction and graph store operations.
#[derive(Error, Debug)]
pub enum GraphError {
    /// A vertex or edge was rejected at insertion (e.g. missing `type` annotation).
    #[error("Malformed entity: {0}")]
    MalformedEntity(String),

    /// A textual content hash could not be parsed.
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl GraphError {
    /// Helper to create a malformed entity error
    pub fn malformed(message: impl Into<String>) -> Self {
        GraphError::MalformedEntity(message.into())
    }

    /// Check if the error describes a rejected entity
    pub fn is_malformed(&self) -> bool {
        matches!(self, GraphError::MalformedEntity(_))
    }
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors reported by storage sinks.
///
/// Sink failures never reach the query path; the store logs them and moves on.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Storage sink '{sink}' rejected {element}: {reason}")]
    Rejected {
        sink: String,
        element: String,
        reason: String,
    },

    #[error("Storage sink unavailable: {0}")]
    Unavailable(String),
}

/// Internal invariant violations detected inside the query result cache.
///
/// A corrupted entry is evicted and treated as a miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache entry for '{descriptor}' is corrupt: {reason}")]
    Corruption { descriptor: String, reason: String },
}

/// Errors produced by graph exporters.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export format not supported by this exporter: {0}")]
    Unsupported(String),

    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
