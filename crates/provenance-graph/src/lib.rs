//! Provenance graph core: entity model, set algebra, graph store, lineage
//! traversal and the query result cache.

// Core modules
pub mod entity;
pub mod error;
pub mod graph;
pub mod traversal;

// Storage and caching
pub mod cache;
pub mod sink;
pub mod store;

// Text codec and export seam
pub mod export;

// Re-export key types for convenient usage
pub use cache::{CacheMetrics, CacheWrite, QueryCache, QueryDescriptor, DEFAULT_CACHE_CAPACITY};
pub use entity::{Annotations, Edge, EdgeId, Vertex, VertexId, NETWORK_TYPE, TYPE_KEY};
pub use error::{CacheError, ExportError, GraphError, GraphResult, SinkError};
pub use export::{GraphExporter, GraphRecord, JsonLinesExporter};
pub use graph::Graph;
pub use sink::{MemorySink, StorageSink};
pub use store::{GraphStore, StoreStats};
pub use traversal::{BoundaryHit, Direction, Traversal, TraversalOutcome};
