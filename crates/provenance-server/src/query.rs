//! Query language.
//!
//! ```text
//! query    := term (op term)*
//! op       := "|" | "&" | "-"
//! term     := ("descendants" | "ancestors") <vertexHash> [<depth>]
//!           | "vertex" <vertexHash>
//! command  := "stats" | "exit"
//! ```
//!
//! Operators are applied left to right without precedence.

use std::fmt;
use std::iter::Peekable;

use provenance_graph::{Direction, Graph, Traversal, VertexId};

use crate::error::QueryError;

/// Set operator combining two terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersection,
    Difference,
}

impl SetOp {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "|" => Some(SetOp::Union),
            "&" => Some(SetOp::Intersection),
            "-" => Some(SetOp::Difference),
            _ => None,
        }
    }

    pub fn apply(&self, left: &Graph, right: &Graph) -> Graph {
        match self {
            SetOp::Union => Graph::union(left, right),
            SetOp::Intersection => Graph::intersection(left, right),
            SetOp::Difference => Graph::difference(left, right),
        }
    }
}

impl fmt::Display for SetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            SetOp::Union => "|",
            SetOp::Intersection => "&",
            SetOp::Difference => "-",
        };
        f.write_str(symbol)
    }
}

/// One operand of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Ancestors or descendants of a vertex up to a depth
    Lineage(Traversal),
    /// A single vertex by hash
    Vertex(VertexId),
}

impl Term {
    pub fn root(&self) -> &VertexId {
        match self {
            Term::Lineage(traversal) => &traversal.start,
            Term::Vertex(id) => id,
        }
    }
}

/// A parsed query: the first term followed by operator/term pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub first: Term,
    pub rest: Vec<(SetOp, Term)>,
}

impl Query {
    /// All terms in evaluation order
    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        std::iter::once(&self.first).chain(self.rest.iter().map(|(_, term)| term))
    }

    /// Vertices the query starts from
    pub fn roots(&self) -> Vec<VertexId> {
        self.terms().map(|term| term.root().clone()).collect()
    }
}

/// A line submitted by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Query(Query),
    Stats,
    Exit,
    /// Blank query text; clients send it to wait for the server to be ready
    Ready,
}

/// Continuation sub-query asking a peer to continue lineage from `start`.
pub fn continuation_query(direction: Direction, start: &VertexId, depth: u32) -> String {
    format!("{direction} {start} {depth}")
}

/// Parser bound to the configured depth limits
#[derive(Debug, Clone, Copy)]
pub struct QueryParser {
    default_depth: u32,
    max_depth: u32,
}

impl QueryParser {
    pub fn new(default_depth: u32, max_depth: u32) -> Self {
        Self {
            default_depth,
            max_depth,
        }
    }

    pub fn parse(&self, text: &str) -> Result<Request, QueryError> {
        let mut tokens = text.split_whitespace().peekable();

        let Some(&first) = tokens.peek() else {
            return Ok(Request::Ready);
        };
        if first.eq_ignore_ascii_case("exit") || first.eq_ignore_ascii_case("stats") {
            tokens.next();
            if let Some(extra) = tokens.next() {
                return Err(QueryError::syntax(format!("unexpected token '{extra}' after '{first}'")));
            }
            return Ok(if first.eq_ignore_ascii_case("exit") {
                Request::Exit
            } else {
                Request::Stats
            });
        }

        let first = self.parse_term(&mut tokens)?;
        let mut rest = Vec::new();
        while let Some(token) = tokens.next() {
            let op = SetOp::from_token(token)
                .ok_or_else(|| QueryError::syntax(format!("expected operator, found '{token}'")))?;
            rest.push((op, self.parse_term(&mut tokens)?));
        }

        Ok(Request::Query(Query { first, rest }))
    }

    fn parse_term<'a, I>(&self, tokens: &mut Peekable<I>) -> Result<Term, QueryError>
    where
        I: Iterator<Item = &'a str>,
    {
        let keyword = tokens
            .next()
            .ok_or_else(|| QueryError::syntax("expected a term"))?;

        match keyword.to_ascii_lowercase().as_str() {
            "vertex" => Ok(Term::Vertex(Self::parse_hash(tokens.next())?)),
            "descendants" | "ancestors" => {
                let direction = keyword
                    .parse::<Direction>()
                    .map_err(|e| QueryError::syntax(e.to_string()))?;
                let start = Self::parse_hash(tokens.next())?;
                let depth = match tokens.peek().copied() {
                    Some(token) if SetOp::from_token(token).is_none() => {
                        let depth = token
                            .parse::<u32>()
                            .map_err(|_| QueryError::syntax(format!("invalid depth '{token}'")))?;
                        tokens.next();
                        depth
                    }
                    _ => self.default_depth,
                };
                if depth > self.max_depth {
                    return Err(QueryError::DepthExceeded {
                        requested: depth,
                        max: self.max_depth,
                    });
                }
                Ok(Term::Lineage(Traversal::new(start, direction, depth)))
            }
            other => Err(QueryError::syntax(format!("unknown term '{other}'"))),
        }
    }

    fn parse_hash(token: Option<&str>) -> Result<VertexId, QueryError> {
        let token = token.ok_or_else(|| QueryError::syntax("expected a vertex hash"))?;
        VertexId::parse(token).map_err(|_| QueryError::syntax(format!("invalid vertex hash '{token}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn parser() -> QueryParser {
        QueryParser::new(16, 64)
    }

    fn id(hash: &str) -> VertexId {
        VertexId::parse(hash).unwrap()
    }

    #[test]
    fn test_commands() {
        assert_eq!(parser().parse("exit").unwrap(), Request::Exit);
        assert_eq!(parser().parse(" STATS ").unwrap(), Request::Stats);
        assert!(parser().parse("exit now").is_err());
    }

    #[test]
    fn test_blank_query_is_ready() {
        assert_eq!(parser().parse("").unwrap(), Request::Ready);
        assert_eq!(parser().parse("  \t ").unwrap(), Request::Ready);
    }

    #[test]
    fn test_lineage_with_default_depth() {
        let request = parser().parse(&format!("descendants {HASH_A}")).unwrap();
        let expected = Query {
            first: Term::Lineage(Traversal::new(id(HASH_A), Direction::Descendants, 16)),
            rest: vec![],
        };
        assert_eq!(request, Request::Query(expected));
    }

    #[test]
    fn test_composed_query() {
        let text = format!("ancestors {HASH_A} 3 | vertex {HASH_B} - descendants {HASH_B}");
        let Request::Query(query) = parser().parse(&text).unwrap() else {
            panic!("expected a query");
        };
        assert_eq!(query.rest.len(), 2);
        assert_eq!(query.rest[0].0, SetOp::Union);
        assert_eq!(query.rest[1].0, SetOp::Difference);
        assert_eq!(query.roots(), vec![id(HASH_A), id(HASH_B), id(HASH_B)]);
        assert_eq!(
            query.first,
            Term::Lineage(Traversal::new(id(HASH_A), Direction::Ancestors, 3))
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parser().parse("lineage abc"), Err(QueryError::Syntax(_))));
        assert!(matches!(parser().parse("descendants nothex"), Err(QueryError::Syntax(_))));
        assert!(matches!(
            parser().parse(&format!("descendants {HASH_A} deep")),
            Err(QueryError::Syntax(_))
        ));
        assert!(matches!(
            parser().parse(&format!("vertex {HASH_A} |")),
            Err(QueryError::Syntax(_))
        ));
        assert!(matches!(
            parser().parse(&format!("vertex {HASH_A} vertex {HASH_B}")),
            Err(QueryError::Syntax(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        assert_eq!(
            parser().parse(&format!("descendants {HASH_A} 65")),
            Err(QueryError::DepthExceeded { requested: 65, max: 64 })
        );
    }

    #[test]
    fn test_continuation_query_round_trips() {
        let text = continuation_query(Direction::Ancestors, &id(HASH_B), 7);
        assert_eq!(text, format!("ancestors {HASH_B} 7"));
        assert!(matches!(parser().parse(&text), Ok(Request::Query(_))));
    }
}
