//! Query session wire format.
//!
//! Newline-delimited UTF-8. A request is `<token> <query>`. Every request is
//! answered by exactly one response block: one or more `<token> <payload>`
//! lines followed by one empty line. The first payload of a block is a status
//! line, so a block can always be attributed to its token:
//!
//! ```text
//! <token> !result <vertices> <edges> <unresolved>
//! <token> {"vertex":{...}}
//! <token> {"edge":{...}}
//! <token> {"unresolved":"..."}
//!
//! <token> !error <message>
//!
//! <token> !stats {...}
//!
//! <token> !closed
//!
//! ```
//!
//! A request with blank query text is a readiness check and is answered with
//! the bare empty line.

use provenance_graph::{ExportError, Graph, GraphExporter, JsonLinesExporter};

use crate::error::ProtocolError;

pub const RESULT_MARKER: &str = "!result";
pub const ERROR_MARKER: &str = "!error";
pub const STATS_MARKER: &str = "!stats";
pub const CLOSED_MARKER: &str = "!closed";

/// Token historically sent by clients that did not pick one
pub const NULL_TOKEN: &str = "null";

/// A request line split into routing token and query text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub token: String,
    pub query: String,
}

impl RequestLine {
    pub fn new(token: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            query: query.into(),
        }
    }

    /// Split a raw line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (token, query) = match line.split_once(char::is_whitespace) {
            Some((token, query)) => (token, query.trim()),
            None => (line, ""),
        };
        Some(Self::new(token, query))
    }

    pub fn encode(&self) -> String {
        format!("{} {}\n", self.token, self.query)
    }
}

/// Lines of one response, written to the connection as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBlock {
    token: String,
    payloads: Vec<String>,
}

impl ResponseBlock {
    fn new(token: &str, payloads: Vec<String>) -> Self {
        Self {
            token: token.to_string(),
            payloads,
        }
    }

    /// A result graph rendered through `exporter`
    pub fn result(token: &str, graph: &Graph, exporter: &dyn GraphExporter) -> Result<Self, ExportError> {
        let mut payloads = vec![format!(
            "{RESULT_MARKER} {} {} {}",
            graph.vertex_count(),
            graph.edge_count(),
            graph.unresolved().count()
        )];
        payloads.extend(exporter.export_text(graph)?);
        Ok(Self::new(token, payloads))
    }

    pub fn error(token: &str, message: impl AsRef<str>) -> Self {
        Self::new(token, vec![format!("{ERROR_MARKER} {}", single_line(message.as_ref()))])
    }

    pub fn stats(token: &str, json: &str) -> Self {
        Self::new(token, vec![format!("{STATS_MARKER} {}", single_line(json))])
    }

    pub fn closed(token: &str) -> Self {
        Self::new(token, vec![CLOSED_MARKER.to_string()])
    }

    /// Answer to a blank query: only the end-of-response marker
    pub fn ready(token: &str) -> Self {
        Self::new(token, Vec::new())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn payloads(&self) -> &[String] {
        &self.payloads
    }

    /// Wire form including the terminating empty line
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for payload in &self.payloads {
            out.push_str(&self.token);
            out.push(' ');
            out.push_str(payload);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Split a response line into token and payload.
pub fn split_response_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(' ') {
        Some((token, payload)) => (token, payload),
        None => (line, ""),
    })
}

/// Reassemble a result graph from the payloads of one response block.
pub fn decode_result(payloads: &[String]) -> Result<Graph, ProtocolError> {
    let (status, records) = payloads
        .split_first()
        .ok_or_else(|| ProtocolError::Malformed("empty response".to_string()))?;

    if let Some(message) = status.strip_prefix(ERROR_MARKER) {
        return Err(ProtocolError::Remote(message.trim().to_string()));
    }
    let counts = status
        .strip_prefix(RESULT_MARKER)
        .ok_or_else(|| ProtocolError::Malformed(format!("unexpected status line '{status}'")))?;
    let counts: Vec<usize> = counts
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| ProtocolError::Malformed(format!("invalid counts in '{status}'")))?;
    let &[vertices, edges, unresolved] = counts.as_slice() else {
        return Err(ProtocolError::Malformed(format!("invalid counts in '{status}'")));
    };

    let graph = JsonLinesExporter
        .parse(records.iter().map(String::as_str))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let received = (graph.vertex_count(), graph.edge_count(), graph.unresolved().count());
    if received != (vertices, edges, unresolved) {
        return Err(ProtocolError::Malformed(format!(
            "announced {vertices}/{edges}/{unresolved} elements, received {}/{}/{}",
            received.0, received.1, received.2
        )));
    }
    Ok(graph)
}
