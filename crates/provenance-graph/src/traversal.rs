//! Lineage traversal over a graph snapshot.
//!
//! A traversal walks edges breadth-first from a start vertex up to a depth
//! budget. Boundary vertices reached on the way are included as leaves and
//! reported back so the caller can continue on the remote host; the local
//! walk never expands through them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::entity::{Edge, EdgeId, Vertex, VertexId};
use crate::error::GraphError;
use crate::graph::Graph;

/// Which way to follow causal edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Follow edges backwards (destination to source).
    Ancestors,
    /// Follow edges forwards (source to destination).
    Descendants,
}

impl Direction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Direction::Ancestors => "ancestors",
            Direction::Descendants => "descendants",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for Direction {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ancestors" => Ok(Direction::Ancestors),
            "descendants" => Ok(Direction::Descendants),
            other => Err(GraphError::malformed(format!("unknown traversal direction '{other}'"))),
        }
    }
}

/// Parameters of a single lineage traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traversal {
    pub start: VertexId,
    pub direction: Direction,
    pub depth: u32,
}

impl Traversal {
    pub fn new(start: VertexId, direction: Direction, depth: u32) -> Self {
        Self {
            start,
            direction,
            depth,
        }
    }
}

/// A boundary vertex reached by a traversal, with the depth left to spend remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryHit {
    pub vertex: Vertex,
    pub remaining_depth: u32,
}

/// Result of a local traversal: the local subgraph plus boundaries to continue from.
#[derive(Debug, Clone, Default)]
pub struct TraversalOutcome {
    pub graph: Graph,
    pub boundaries: Vec<BoundaryHit>,
}

/// Incoming/outgoing edge index kept alongside the store's graph.
#[derive(Debug, Default)]
pub(crate) struct AdjacencyIndex {
    outgoing: HashMap<VertexId, HashSet<EdgeId>>,
    incoming: HashMap<VertexId, HashSet<EdgeId>>,
}

impl AdjacencyIndex {
    pub(crate) fn add(&mut self, edge: &Edge) {
        self.outgoing
            .entry(edge.source().clone())
            .or_default()
            .insert(edge.id().clone());
        self.incoming
            .entry(edge.destination().clone())
            .or_default()
            .insert(edge.id().clone());
    }

    pub(crate) fn remove(&mut self, edge: &Edge) {
        if let Some(ids) = self.outgoing.get_mut(edge.source()) {
            ids.remove(edge.id());
            if ids.is_empty() {
                self.outgoing.remove(edge.source());
            }
        }
        if let Some(ids) = self.incoming.get_mut(edge.destination()) {
            ids.remove(edge.id());
            if ids.is_empty() {
                self.incoming.remove(edge.destination());
            }
        }
    }

    fn edges_from(&self, vertex: &VertexId, direction: Direction) -> Option<&HashSet<EdgeId>> {
        match direction {
            Direction::Descendants => self.outgoing.get(vertex),
            Direction::Ancestors => self.incoming.get(vertex),
        }
    }
}

fn neighbour(edge: &Edge, direction: Direction) -> &VertexId {
    match direction {
        Direction::Descendants => edge.destination(),
        Direction::Ancestors => edge.source(),
    }
}

/// Breadth-first walk over `graph` using `index`.
///
/// The start vertex is never treated as a boundary: a continuation that
/// starts on a network vertex expands locally from it.
pub(crate) fn walk(graph: &Graph, index: &AdjacencyIndex, traversal: &Traversal) -> TraversalOutcome {
    let mut outcome = TraversalOutcome::default();

    let Some(start) = graph.vertex(&traversal.start) else {
        return outcome;
    };
    outcome.graph.put_vertex(start.clone());

    let mut visited: HashSet<&VertexId> = HashSet::from([start.id()]);
    let mut frontier: VecDeque<(&VertexId, u32)> = VecDeque::from([(start.id(), 0)]);

    while let Some((current, level)) = frontier.pop_front() {
        if level >= traversal.depth {
            continue;
        }
        let Some(edge_ids) = index.edges_from(current, traversal.direction) else {
            continue;
        };

        let mut edges: Vec<&Edge> = edge_ids.iter().filter_map(|id| graph.edge(id)).collect();
        edges.sort_by(|a, b| a.id().cmp(b.id()));

        for edge in edges {
            outcome.graph.put_edge(edge.clone());

            let next = neighbour(edge, traversal.direction);
            if !visited.insert(next) {
                continue;
            }
            // Dangling endpoint: keep the edge, nothing further to expand here.
            let Some(vertex) = graph.vertex(next) else {
                continue;
            };
            outcome.graph.put_vertex(vertex.clone());

            if vertex.is_boundary() {
                outcome.boundaries.push(BoundaryHit {
                    vertex: vertex.clone(),
                    remaining_depth: traversal.depth - (level + 1),
                });
            } else {
                frontier.push_back((vertex.id(), level + 1));
            }
        }
    }

    outcome.boundaries.sort_by(|a, b| a.vertex.id().cmp(b.vertex.id()));
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(kind: &str, name: &str) -> Vertex {
        Vertex::from_pairs([("type", kind), ("name", name)]).unwrap()
    }

    fn build(edges: &[(&Vertex, &Vertex)], vertices: &[&Vertex]) -> (Graph, AdjacencyIndex) {
        let mut graph = Graph::new();
        let mut index = AdjacencyIndex::default();
        for v in vertices {
            graph.put_vertex((*v).clone());
        }
        for (from, to) in edges {
            let edge = Edge::between(from, to, [("type", "WasDerivedFrom")]).unwrap();
            index.add(&edge);
            graph.put_edge(edge);
        }
        (graph, index)
    }

    #[test]
    fn test_depth_budget_limits_walk() {
        let a = vertex("Process", "a");
        let b = vertex("Process", "b");
        let c = vertex("Process", "c");
        let (graph, index) = build(&[(&a, &b), (&b, &c)], &[&a, &b, &c]);

        let one = walk(&graph, &index, &Traversal::new(a.id().clone(), Direction::Descendants, 1));
        assert_eq!(one.graph.vertex_count(), 2);
        assert_eq!(one.graph.edge_count(), 1);

        let two = walk(&graph, &index, &Traversal::new(a.id().clone(), Direction::Descendants, 2));
        assert_eq!(two.graph.vertex_count(), 3);

        let up = walk(&graph, &index, &Traversal::new(c.id().clone(), Direction::Ancestors, 5));
        assert_eq!(up.graph.vertex_count(), 3);
        assert_eq!(up.graph.edge_count(), 2);
    }

    #[test]
    fn test_boundary_short_circuits() {
        let p = vertex("Process", "p");
        let net = Vertex::from_pairs([("type", "Network"), ("remote address", "10.0.0.7")]).unwrap();
        let beyond = vertex("Artifact", "beyond");
        let (graph, index) = build(&[(&p, &net), (&net, &beyond)], &[&p, &net, &beyond]);

        let outcome = walk(&graph, &index, &Traversal::new(p.id().clone(), Direction::Descendants, 4));
        assert!(outcome.graph.contains_vertex(net.id()));
        assert!(!outcome.graph.contains_vertex(beyond.id()));
        assert_eq!(outcome.boundaries.len(), 1);
        assert_eq!(outcome.boundaries[0].remaining_depth, 3);
    }

    #[test]
    fn test_start_boundary_expands_locally() {
        let net = Vertex::from_pairs([("type", "Network"), ("remote address", "10.0.0.7")]).unwrap();
        let served = vertex("Process", "sshd");
        let (graph, index) = build(&[(&net, &served)], &[&net, &served]);

        let outcome = walk(&graph, &index, &Traversal::new(net.id().clone(), Direction::Descendants, 2));
        assert!(outcome.graph.contains_vertex(served.id()));
        assert!(outcome.boundaries.is_empty());
    }

    #[test]
    fn test_missing_start_yields_empty_graph() {
        let a = vertex("Process", "a");
        let (graph, index) = build(&[], &[]);
        let outcome = walk(&graph, &index, &Traversal::new(a.id().clone(), Direction::Ancestors, 3));
        assert!(outcome.graph.is_empty());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("Descendants".parse::<Direction>().unwrap(), Direction::Descendants);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
