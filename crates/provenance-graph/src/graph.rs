//! Provenance subgraphs and their set algebra.

use std::collections::{BTreeSet, HashMap};

use crate::entity::{Edge, EdgeId, Vertex, VertexId};

/// A set of vertices and a set of edges, both keyed by content hash.
///
/// Edges may reference vertices that are not part of the same graph; partial
/// and boundary subgraphs are valid. Vertices whose remote continuation failed
/// are tracked in a separate `unresolved` set so their identity stays intact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    vertices: HashMap<VertexId, Vertex>,
    edges: HashMap<EdgeId, Edge>,
    unresolved: BTreeSet<VertexId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a vertex. Returns `false` when an identical vertex is already present.
    pub fn put_vertex(&mut self, vertex: Vertex) -> bool {
        if self.vertices.contains_key(vertex.id()) {
            return false;
        }
        self.vertices.insert(vertex.id().clone(), vertex);
        true
    }

    /// Insert an edge. Endpoints do not have to be present.
    pub fn put_edge(&mut self, edge: Edge) -> bool {
        if self.edges.contains_key(edge.id()) {
            return false;
        }
        self.edges.insert(edge.id().clone(), edge);
        true
    }

    pub fn remove_vertex(&mut self, id: &VertexId) -> Option<Vertex> {
        self.unresolved.remove(id);
        self.vertices.remove(id)
    }

    pub fn remove_edge(&mut self, id: &EdgeId) -> Option<Edge> {
        self.edges.remove(id)
    }

    pub fn vertex(&self, id: &VertexId) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains_vertex(&self, id: &VertexId) -> bool {
        self.vertices.contains_key(id)
    }

    pub fn contains_edge(&self, id: &EdgeId) -> bool {
        self.edges.contains_key(id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn vertex_ids(&self) -> BTreeSet<VertexId> {
        self.vertices.keys().cloned().collect()
    }

    pub fn edge_ids(&self) -> BTreeSet<EdgeId> {
        self.edges.keys().cloned().collect()
    }

    /// Vertices ordered by hash, for deterministic output.
    pub fn sorted_vertices(&self) -> Vec<&Vertex> {
        let mut vertices: Vec<&Vertex> = self.vertices.values().collect();
        vertices.sort_by(|a, b| a.id().cmp(b.id()));
        vertices
    }

    /// Edges ordered by hash, for deterministic output.
    pub fn sorted_edges(&self) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.values().collect();
        edges.sort_by(|a, b| a.id().cmp(b.id()));
        edges
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Total number of elements (vertices plus edges)
    pub fn size(&self) -> usize {
        self.vertex_count() + self.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.edges.is_empty()
    }

    /// Mark a boundary vertex whose remote continuation could not be completed.
    /// Ignored when the vertex is not part of this graph.
    pub fn mark_unresolved(&mut self, id: &VertexId) -> bool {
        if !self.vertices.contains_key(id) {
            return false;
        }
        self.unresolved.insert(id.clone())
    }

    pub fn is_unresolved(&self, id: &VertexId) -> bool {
        self.unresolved.contains(id)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &VertexId> {
        self.unresolved.iter()
    }

    /// A partial result contains at least one unresolved boundary vertex.
    pub fn is_partial(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Whether the two graphs share any vertex or edge.
    pub fn intersects(&self, other: &Graph) -> bool {
        let (small, large) = order_by_size(self, other);
        small.vertices.keys().any(|id| large.vertices.contains_key(id))
            || small.edges.keys().any(|id| large.edges.contains_key(id))
    }

    /// Hashes of every vertex and edge, used as dependency keys.
    pub fn element_keys(&self) -> impl Iterator<Item = &str> {
        self.vertices
            .keys()
            .map(VertexId::as_str)
            .chain(self.edges.keys().map(EdgeId::as_str))
    }

    /// In-place union: absorb every element of `other`.
    pub fn merge(&mut self, other: Graph) {
        for (id, vertex) in other.vertices {
            self.vertices.entry(id).or_insert(vertex);
        }
        for (id, edge) in other.edges {
            self.edges.entry(id).or_insert(edge);
        }
        self.unresolved.extend(other.unresolved);
    }

    /// New graph holding the union of both operands' vertex and edge sets.
    pub fn union(a: &Graph, b: &Graph) -> Graph {
        let (small, large) = order_by_size(a, b);
        let mut result = large.clone();
        result.merge(small.clone());
        result
    }

    /// New graph holding only the vertices and edges present in both operands.
    pub fn intersection(a: &Graph, b: &Graph) -> Graph {
        let (small, large) = order_by_size(a, b);
        let mut result = Graph::new();

        for (id, vertex) in &small.vertices {
            if large.vertices.contains_key(id) {
                result.vertices.insert(id.clone(), vertex.clone());
            }
        }
        for (id, edge) in &small.edges {
            if large.edges.contains_key(id) {
                result.edges.insert(id.clone(), edge.clone());
            }
        }
        result.unresolved = small
            .unresolved
            .iter()
            .filter(|id| large.unresolved.contains(*id) && result.vertices.contains_key(*id))
            .cloned()
            .collect();

        result
    }

    /// New graph holding the vertices and edges of `a` that are not in `b`.
    pub fn difference(a: &Graph, b: &Graph) -> Graph {
        let mut result = Graph::new();

        for (id, vertex) in &a.vertices {
            if !b.vertices.contains_key(id) {
                result.vertices.insert(id.clone(), vertex.clone());
            }
        }
        for (id, edge) in &a.edges {
            if !b.edges.contains_key(id) {
                result.edges.insert(id.clone(), edge.clone());
            }
        }
        result.unresolved = a
            .unresolved
            .iter()
            .filter(|id| result.vertices.contains_key(*id))
            .cloned()
            .collect();

        result
    }
}

fn order_by_size<'a>(a: &'a Graph, b: &'a Graph) -> (&'a Graph, &'a Graph) {
    if a.size() <= b.size() {
        (a, b)
    } else {
        (b, a)
    }
}
