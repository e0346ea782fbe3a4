//! Vertex and edge records with content-addressed identity.
//!
//! Identity is a SHA-256 digest over the canonicalized annotations, so two
//! hosts that record the same entity agree on its identifier without sharing
//! any object references.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GraphError, GraphResult};

/// Annotation key holding the entity type.
pub const TYPE_KEY: &str = "type";

/// Vertex type marking a reference to another host's graph.
pub const NETWORK_TYPE: &str = "Network";

/// Length of a hex-encoded SHA-256 digest
const HASH_HEX_LEN: usize = 64;

/// String-keyed annotation map. Sorted keys make hashing order independent.
pub type Annotations = BTreeMap<String, String>;

/// Content hash identifying a vertex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VertexId(String);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl VertexId {
    /// Parse a hex digest, as typed by a client or sent by a peer.
    pub fn parse(hash_str: &str) -> GraphResult<Self> {
        validate_hex(hash_str)?;
        Ok(Self(hash_str.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VertexId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VertexId> for String {
    fn from(id: VertexId) -> Self {
        id.0
    }
}

/// Content hash identifying an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EdgeId(String);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EdgeId {
    pub fn parse(hash_str: &str) -> GraphResult<Self> {
        validate_hex(hash_str)?;
        Ok(Self(hash_str.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EdgeId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EdgeId> for String {
    fn from(id: EdgeId) -> Self {
        id.0
    }
}

fn validate_hex(hash_str: &str) -> GraphResult<()> {
    if hash_str.len() != HASH_HEX_LEN || !hash_str.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GraphError::InvalidHash(hash_str.to_string()));
    }
    Ok(())
}

/// Length-prefixed field so that ("ab", "c") and ("a", "bc") never collide.
fn update_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

fn update_annotations(hasher: &mut Sha256, annotations: &Annotations) {
    hasher.update((annotations.len() as u64).to_be_bytes());
    for (key, value) in annotations {
        update_field(hasher, key);
        update_field(hasher, value);
    }
}

fn require_type(annotations: &Annotations, kind: &str) -> GraphResult<()> {
    match annotations.get(TYPE_KEY) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        Some(_) => Err(GraphError::malformed(format!(
            "{kind} has an empty '{TYPE_KEY}' annotation"
        ))),
        None => Err(GraphError::malformed(format!(
            "{kind} is missing the '{TYPE_KEY}' annotation"
        ))),
    }
}

fn collect_pairs<I, K, V>(pairs: I) -> Annotations
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A provenance vertex (process, artifact, network endpoint, ...).
///
/// Fields are private: once constructed, a vertex cannot change, so its
/// identifier always matches its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Annotations", into = "Annotations")]
pub struct Vertex {
    id: VertexId,
    annotations: Annotations,
}

impl Vertex {
    /// Build a vertex, rejecting annotation maps without a `type`.
    pub fn new(annotations: Annotations) -> GraphResult<Self> {
        require_type(&annotations, "vertex")?;

        let mut hasher = Sha256::new();
        hasher.update(b"vertex");
        update_annotations(&mut hasher, &annotations);
        let id = VertexId(hex::encode(hasher.finalize()));

        Ok(Self { id, annotations })
    }

    /// Convenience constructor from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(collect_pairs(pairs))
    }

    pub fn id(&self) -> &VertexId {
        &self.id
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn vertex_type(&self) -> &str {
        self.annotation(TYPE_KEY).unwrap_or_default()
    }

    /// Whether this vertex references provenance held by another host.
    pub fn is_boundary(&self) -> bool {
        self.vertex_type().eq_ignore_ascii_case(NETWORK_TYPE)
    }
}

impl TryFrom<Annotations> for Vertex {
    type Error = GraphError;

    fn try_from(annotations: Annotations) -> Result<Self, Self::Error> {
        Self::new(annotations)
    }
}

impl From<Vertex> for Annotations {
    fn from(vertex: Vertex) -> Self {
        vertex.annotations
    }
}

/// Serialized form of an edge: endpoints by hash plus annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRecord {
    from: VertexId,
    to: VertexId,
    annotations: Annotations,
}

/// A directed causal relationship between two vertices.
///
/// Endpoints are held by hash only; the owning graph decides whether the
/// endpoint vertices are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EdgeRecord", into = "EdgeRecord")]
pub struct Edge {
    id: EdgeId,
    source: VertexId,
    destination: VertexId,
    annotations: Annotations,
}

impl Edge {
    pub fn new(source: VertexId, destination: VertexId, annotations: Annotations) -> GraphResult<Self> {
        require_type(&annotations, "edge")?;

        let mut hasher = Sha256::new();
        hasher.update(b"edge");
        update_field(&mut hasher, source.as_str());
        update_field(&mut hasher, destination.as_str());
        update_annotations(&mut hasher, &annotations);
        let id = EdgeId(hex::encode(hasher.finalize()));

        Ok(Self {
            id,
            source,
            destination,
            annotations,
        })
    }

    /// Build an edge between two existing vertices.
    pub fn between<I, K, V>(source: &Vertex, destination: &Vertex, pairs: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            source.id().clone(),
            destination.id().clone(),
            collect_pairs(pairs),
        )
    }

    pub fn id(&self) -> &EdgeId {
        &self.id
    }

    pub fn source(&self) -> &VertexId {
        &self.source
    }

    pub fn destination(&self) -> &VertexId {
        &self.destination
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn edge_type(&self) -> &str {
        self.annotation(TYPE_KEY).unwrap_or_default()
    }
}

impl TryFrom<EdgeRecord> for Edge {
    type Error = GraphError;

    fn try_from(record: EdgeRecord) -> Result<Self, Self::Error> {
        Self::new(record.from, record.to, record.annotations)
    }
}

impl From<Edge> for EdgeRecord {
    fn from(edge: Edge) -> Self {
        EdgeRecord {
            from: edge.source,
            to: edge.destination,
            annotations: edge.annotations,
        }
    }
}
