//! In-memory provenance graph store.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::entity::{Edge, Vertex, VertexId};
use crate::export::GraphRecord;
use crate::graph::Graph;
use crate::sink::StorageSink;
use crate::traversal::{self, AdjacencyIndex, Traversal, TraversalOutcome};

/// Element counts of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub vertices: usize,
    pub edges: usize,
    pub boundaries: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    graph: Graph,
    index: AdjacencyIndex,
    /// Network vertices registered as continuation candidates
    boundaries: BTreeSet<VertexId>,
}

/// Mutable vertex/edge collection shared by all query sessions.
///
/// Structural mutation is serialized against traversals with a
/// readers-writer lock, so every traversal sees a consistent snapshot.
/// Every successful insertion or removal invalidates the attached query
/// cache and every successful insertion is forwarded to the storage sinks.
pub struct GraphStore {
    state: RwLock<StoreState>,
    cache: Option<Arc<QueryCache>>,
    sinks: Vec<Arc<dyn StorageSink>>,
    traversals: AtomicU64,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("stats", &self.stats())
            .field("sinks", &self.sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .field("traversals", &self.traversal_count())
            .finish()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            cache: None,
            sinks: Vec::new(),
            traversals: AtomicU64::new(0),
        }
    }

    /// Attach the query cache invalidated by mutations of this store.
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach a storage sink receiving every newly inserted element.
    pub fn with_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    /// Insert a vertex; `true` iff it was not present yet.
    pub fn put_vertex(&self, vertex: Vertex) -> bool {
        {
            let mut state = self.state.write();
            if !state.graph.put_vertex(vertex.clone()) {
                return false;
            }
            if vertex.is_boundary() {
                state.boundaries.insert(vertex.id().clone());
                debug!(vertex = %vertex.id(), "Registered continuation candidate");
            }
        }

        self.invalidate(vec![vertex.id().as_str().to_string()]);
        for sink in &self.sinks {
            if let Err(err) = sink.put_vertex(&vertex) {
                warn!(sink = sink.name(), vertex = %vertex.id(), error = %err, "Storage sink failed");
            }
        }
        true
    }

    /// Insert an edge; `true` iff it was not present yet. Endpoints need not exist.
    pub fn put_edge(&self, edge: Edge) -> bool {
        {
            let mut state = self.state.write();
            if !state.graph.put_edge(edge.clone()) {
                return false;
            }
            state.index.add(&edge);
        }

        self.invalidate(vec![
            edge.id().as_str().to_string(),
            edge.source().as_str().to_string(),
            edge.destination().as_str().to_string(),
        ]);
        for sink in &self.sinks {
            if let Err(err) = sink.put_edge(&edge) {
                warn!(sink = sink.name(), edge = %edge.id(), error = %err, "Storage sink failed");
            }
        }
        true
    }

    /// Insert a decoded record. Unresolved markers carry no store state.
    pub fn put_record(&self, record: GraphRecord) -> bool {
        match record {
            GraphRecord::Vertex(vertex) => self.put_vertex(vertex),
            GraphRecord::Edge(edge) => self.put_edge(edge),
            GraphRecord::Unresolved(_) => false,
        }
    }

    /// Insert every element of `graph`. Returns the number of new elements.
    pub fn put_graph(&self, graph: &Graph) -> usize {
        let vertices = graph
            .sorted_vertices()
            .into_iter()
            .filter(|v| self.put_vertex((*v).clone()))
            .count();
        let edges = graph
            .sorted_edges()
            .into_iter()
            .filter(|e| self.put_edge((*e).clone()))
            .count();
        vertices + edges
    }

    /// Remove every vertex and edge of `graph` from the store.
    /// Returns the number of elements actually removed.
    pub fn remove(&self, graph: &Graph) -> usize {
        let removed = {
            let mut state = self.state.write();
            let mut removed = 0;
            for vertex in graph.vertices() {
                if state.graph.remove_vertex(vertex.id()).is_some() {
                    state.boundaries.remove(vertex.id());
                    removed += 1;
                }
            }
            for edge in graph.edges() {
                if let Some(edge) = state.graph.remove_edge(edge.id()) {
                    state.index.remove(&edge);
                    removed += 1;
                }
            }
            removed
        };

        if let Some(cache) = &self.cache {
            let evicted = cache.invalidate(graph);
            debug!(removed, evicted, "Removed elements from store");
        }
        removed
    }

    /// Walk lineage from a vertex against a consistent snapshot.
    pub fn traverse(&self, traversal: &Traversal) -> TraversalOutcome {
        let state = self.state.read();
        self.traversals.fetch_add(1, Ordering::Relaxed);
        let outcome = traversal::walk(&state.graph, &state.index, traversal);
        debug!(
            start = %traversal.start,
            direction = %traversal.direction,
            depth = traversal.depth,
            vertices = outcome.graph.vertex_count(),
            edges = outcome.graph.edge_count(),
            boundaries = outcome.boundaries.len(),
            "Traversal complete"
        );
        outcome
    }

    /// Number of traversals executed so far.
    pub fn traversal_count(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    pub fn vertex(&self, id: &VertexId) -> Option<Vertex> {
        self.state.read().graph.vertex(id).cloned()
    }

    pub fn contains_vertex(&self, id: &VertexId) -> bool {
        self.state.read().graph.contains_vertex(id)
    }

    /// Registered network vertices, ordered by hash.
    pub fn boundary_vertices(&self) -> Vec<Vertex> {
        let state = self.state.read();
        state
            .boundaries
            .iter()
            .filter_map(|id| state.graph.vertex(id).cloned())
            .collect()
    }

    /// Copy of the whole stored graph.
    pub fn snapshot(&self) -> Graph {
        self.state.read().graph.clone()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            vertices: state.graph.vertex_count(),
            edges: state.graph.edge_count(),
            boundaries: state.boundaries.len(),
        }
    }

    /// Load records, e.g. from a seed file. Returns the number of new elements.
    pub fn load(&self, records: impl IntoIterator<Item = GraphRecord>) -> usize {
        let added = records
            .into_iter()
            .map(|record| self.put_record(record))
            .filter(|added| *added)
            .count();
        let stats = self.stats();
        info!(added, vertices = stats.vertices, edges = stats.edges, "Loaded provenance records");
        added
    }

    fn invalidate(&self, keys: Vec<String>) {
        if let Some(cache) = &self.cache {
            cache.invalidate_elements(keys);
        }
    }
}
