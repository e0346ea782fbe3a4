//! Storage sink seam.
//!
//! A sink receives every vertex and edge newly inserted into the store, e.g.
//! to persist it. Sinks are called synchronously after the store's write lock
//! has been released.

use parking_lot::RwLock;

use crate::entity::{Edge, Vertex};
use crate::error::SinkError;

/// Persistent or forwarding backend behind the in-memory store
pub trait StorageSink: Send + Sync + 'static {
    /// Name used in log lines
    fn name(&self) -> &str;

    fn put_vertex(&self, vertex: &Vertex) -> Result<(), SinkError>;

    fn put_edge(&self, edge: &Edge) -> Result<(), SinkError>;
}

/// In-memory sink recording everything it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    vertices: RwLock<Vec<Vertex>>,
    edges: RwLock<Vec<Edge>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertices(&self) -> Vec<Vertex> {
        self.vertices.read().clone()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.edges.read().clone()
    }
}

impl StorageSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn put_vertex(&self, vertex: &Vertex) -> Result<(), SinkError> {
        self.vertices.write().push(vertex.clone());
        Ok(())
    }

    fn put_edge(&self, edge: &Edge) -> Result<(), SinkError> {
        self.edges.write().push(edge.clone());
        Ok(())
    }
}
