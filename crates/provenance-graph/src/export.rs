//! Graph export.
//!
//! The built-in text codec writes one JSON record per line: vertices sorted by
//! hash, then edges, then unresolved markers. The same records are streamed to
//! query clients, parsed back from continuation peers and read from seed files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::entity::{Edge, Vertex, VertexId};
use crate::error::{ExportError, GraphError, GraphResult};
use crate::graph::Graph;

/// A single serialized graph element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphRecord {
    Vertex(Vertex),
    Edge(Edge),
    /// Boundary vertex whose remote continuation could not be completed
    Unresolved(VertexId),
}

impl GraphRecord {
    pub fn encode(&self) -> GraphResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line. Vertex and edge identities are recomputed from content.
    pub fn decode(line: &str) -> GraphResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl Graph {
    /// Records in deterministic order.
    pub fn records(&self) -> Vec<GraphRecord> {
        let mut records: Vec<GraphRecord> = self
            .sorted_vertices()
            .into_iter()
            .cloned()
            .map(GraphRecord::Vertex)
            .collect();
        records.extend(self.sorted_edges().into_iter().cloned().map(GraphRecord::Edge));
        records.extend(self.unresolved().cloned().map(GraphRecord::Unresolved));
        records
    }

    /// Add one record to this graph. Unresolved markers for absent vertices are ignored.
    pub fn apply(&mut self, record: GraphRecord) -> bool {
        match record {
            GraphRecord::Vertex(vertex) => self.put_vertex(vertex),
            GraphRecord::Edge(edge) => self.put_edge(edge),
            GraphRecord::Unresolved(id) => self.mark_unresolved(&id),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = GraphRecord>) -> Graph {
        let mut graph = Graph::new();
        let mut unresolved = Vec::new();
        for record in records {
            match record {
                GraphRecord::Unresolved(id) => unresolved.push(id),
                other => {
                    graph.apply(other);
                }
            }
        }
        for id in unresolved {
            graph.mark_unresolved(&id);
        }
        graph
    }
}

/// Export collaborator: renders a graph for people or other tools.
pub trait GraphExporter: Send + Sync {
    /// Render the graph as text lines (without trailing newlines).
    fn export_text(&self, graph: &Graph) -> Result<Vec<String>, ExportError>;

    /// Write a graphical rendering of the graph to `destination`.
    fn export_graphical(&self, graph: &Graph, destination: &Path) -> Result<(), ExportError>;
}

/// JSON-lines text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesExporter;

impl JsonLinesExporter {
    /// Parse lines produced by [`GraphExporter::export_text`]. Blank lines are skipped.
    pub fn parse<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> GraphResult<Graph> {
        let records = lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(GraphRecord::decode)
            .collect::<Result<Vec<_>, GraphError>>()?;
        Ok(Graph::from_records(records))
    }
}

impl GraphExporter for JsonLinesExporter {
    fn export_text(&self, graph: &Graph) -> Result<Vec<String>, ExportError> {
        let lines = graph
            .records()
            .iter()
            .map(GraphRecord::encode)
            .collect::<GraphResult<Vec<_>>>()?;
        Ok(lines)
    }

    fn export_graphical(&self, _graph: &Graph, destination: &Path) -> Result<(), ExportError> {
        Err(ExportError::Unsupported(format!(
            "graphical export to {}",
            destination.display()
        )))
    }
}
