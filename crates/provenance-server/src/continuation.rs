//! Remote continuation of lineage traversals.
//!
//! A network vertex names the host holding the other side of a connection.
//! When a traversal reaches one, the resolver asks that host to continue the
//! same lineage from the same vertex (both hosts compute the same content
//! hash for it) with the depth budget that is left.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use provenance_graph::{Direction, Graph, QueryDescriptor, Vertex};
use provenance_monitoring::{ContinuationOutcome, QueryMetrics};

use crate::error::{ContinuationError, ProtocolError};
use crate::protocol::{decode_result, split_response_line, RequestLine};
use crate::query::continuation_query;

/// Annotation holding the peer host of a network vertex
pub const REMOTE_ADDRESS_KEY: &str = "remote address";

/// Optional annotation holding the peer's query port
pub const REMOTE_QUERY_PORT_KEY: &str = "remote query port";

/// Traversal state handed over with a boundary vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationParams {
    pub direction: Direction,
    /// Depth left after reaching the boundary
    pub depth: u32,
    /// Query that led to this continuation, for logging
    pub descriptor: QueryDescriptor,
}

/// Capability to continue a traversal on the host behind a boundary vertex.
#[async_trait]
pub trait ContinuationResolver: Send + Sync + 'static {
    /// Fetch the remote part of the lineage starting at `boundary`.
    async fn resolve(&self, boundary: &Vertex, params: &ContinuationParams) -> Result<Graph, ContinuationError>;
}

/// Configuration for the remote resolver
#[derive(Debug, Clone)]
pub struct RemoteResolverConfig {
    /// Bound on connect plus the whole exchange
    pub timeout: Duration,
    /// Query port used when the vertex does not name one
    pub default_port: u16,
}

impl Default for RemoteResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            default_port: 3333,
        }
    }
}

/// Resolver speaking the session protocol to the peer
#[derive(Debug, Clone)]
pub struct RemoteContinuationResolver {
    config: RemoteResolverConfig,
}

impl RemoteContinuationResolver {
    pub fn new(config: RemoteResolverConfig) -> Self {
        Self { config }
    }

    /// Decode `{host, port}` from a network vertex.
    pub fn peer_of(&self, boundary: &Vertex) -> Result<(String, u16), ContinuationError> {
        if !boundary.is_boundary() {
            return Err(ContinuationError::NotABoundary(boundary.id().to_string()));
        }
        let host = boundary
            .annotation(REMOTE_ADDRESS_KEY)
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ContinuationError::NotABoundary(boundary.id().to_string()))?;
        let port = match boundary.annotation(REMOTE_QUERY_PORT_KEY) {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| ContinuationError::NotABoundary(boundary.id().to_string()))?,
            None => self.config.default_port,
        };
        Ok((host.to_string(), port))
    }

    /// Send one request and collect the payloads of its response block.
    async fn exchange(&self, host: &str, port: u16, request: &RequestLine) -> Result<Vec<String>, ContinuationError> {
        let peer = display_peer(host, port);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ContinuationError::Unreachable {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
        let (reader, mut writer) = stream.into_split();

        let io_error = |e: std::io::Error| ContinuationError::Protocol {
            peer: peer.clone(),
            reason: e.to_string(),
        };

        writer.write_all(request.encode().as_bytes()).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)?;

        let mut lines = BufReader::new(reader).lines();
        let mut payloads = Vec::new();
        loop {
            let Some(line) = lines.next_line().await.map_err(io_error)? else {
                return Err(ContinuationError::Protocol {
                    peer: peer.clone(),
                    reason: "connection closed before end of response".to_string(),
                });
            };
            let Some((token, payload)) = split_response_line(&line) else {
                break;
            };
            if token != request.token {
                return Err(ContinuationError::Protocol {
                    peer: peer.clone(),
                    reason: format!("response routed to unknown token '{token}'"),
                });
            }
            payloads.push(payload.to_string());
        }

        Ok(payloads)
    }
}

fn display_peer(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[async_trait]
impl ContinuationResolver for RemoteContinuationResolver {
    #[instrument(skip(self, boundary, params), fields(boundary = %boundary.id(), descriptor = %params.descriptor))]
    async fn resolve(&self, boundary: &Vertex, params: &ContinuationParams) -> Result<Graph, ContinuationError> {
        let (host, port) = self.peer_of(boundary)?;
        let peer = display_peer(&host, port);
        let request = RequestLine::new(
            Uuid::new_v4().simple().to_string(),
            continuation_query(params.direction, boundary.id(), params.depth),
        );
        debug!(peer = %peer, query = %request.query, "Requesting remote continuation");

        let started = Instant::now();
        let exchanged = tokio::time::timeout(self.config.timeout, self.exchange(&host, port, &request)).await;

        let result = match exchanged {
            Err(_) => Err(ContinuationError::Timeout {
                peer: peer.clone(),
                timeout_ms: self.config.timeout.as_millis() as u64,
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(payloads)) => decode_result(&payloads).map_err(|err| match err {
                ProtocolError::Remote(message) => ContinuationError::Peer {
                    peer: peer.clone(),
                    message,
                },
                ProtocolError::Malformed(reason) => ContinuationError::Protocol {
                    peer: peer.clone(),
                    reason,
                },
            }),
        };

        let outcome = match &result {
            Ok(_) => ContinuationOutcome::Resolved,
            Err(ContinuationError::Unreachable { .. }) => ContinuationOutcome::Unreachable,
            Err(ContinuationError::Timeout { .. }) => ContinuationOutcome::TimedOut,
            Err(_) => ContinuationOutcome::Failed,
        };
        QueryMetrics::record_continuation(&peer, outcome, started.elapsed());

        match &result {
            Ok(graph) => debug!(
                peer = %peer,
                vertices = graph.vertex_count(),
                edges = graph.edge_count(),
                "Remote continuation resolved"
            ),
            Err(err) => warn!(peer = %peer, error = %err, "Remote continuation failed"),
        }
        result
    }
}
