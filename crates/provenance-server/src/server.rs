//! TCP query server.
//!
//! One task per connection reads request lines and routes each to the session
//! named by its token, spawning the session on first use. Each session is its
//! own task, so a slow query never blocks another token. All sessions of a
//! connection hand finished response blocks to a single writer task, which
//! writes every block in one piece so lines of different tokens never
//! interleave.
//!
//! Lines are read as bytes. A line that is not valid UTF-8 is answered with an
//! error on its token and never ends the connection. When the client stops
//! sending, finished and queued responses are still written for a short grace
//! period before in-flight sessions are abandoned.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use provenance_graph::{GraphExporter, JsonLinesExporter, QueryDescriptor};
use provenance_monitoring::{QueryMetrics, QueryOutcome, SessionMetrics};

use crate::config::ServerConfig;
use crate::engine::QueryEngine;
use crate::error::{ServerError, ServerResult};
use crate::protocol::{RequestLine, ResponseBlock};
use crate::query::{QueryParser, Request};

/// Pending response blocks per connection
const WRITER_QUEUE: usize = 64;

/// How long queued work may still finish after the client stops sending
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of one routing token's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingQuery,
    Evaluating,
    StreamingResult,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingQuery => "AWAITING_QUERY",
            SessionState::Evaluating => "EVALUATING",
            SessionState::StreamingResult => "STREAMING_RESULT",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Everything a session needs; shared by all connections.
struct SessionContext {
    engine: Arc<QueryEngine>,
    parser: QueryParser,
    exporter: Arc<dyn GraphExporter>,
}

/// Handle kept by the connection for a running session
struct SessionHandle {
    queries: mpsc::UnboundedSender<SessionInput>,
    task: JoinHandle<()>,
}

/// Query server bound to a listening socket
pub struct QueryServer {
    listener: TcpListener,
    context: Arc<SessionContext>,
}

impl fmt::Debug for QueryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryServer")
            .field("address", &self.listener.local_addr().ok())
            .field("engine", &self.context.engine)
            .finish()
    }
}

impl QueryServer {
    /// Bind the listener configured in `config`.
    pub async fn bind(config: &ServerConfig, engine: Arc<QueryEngine>) -> ServerResult<Self> {
        let address = config.listen_address();
        let bound = TcpListener::bind(address.as_str()).await;
        let listener = bound.map_err(|source| ServerError::Bind { address, source })?;

        Ok(Self {
            listener,
            context: Arc::new(SessionContext {
                engine,
                parser: QueryParser::new(config.default_traversal_depth, config.max_traversal_depth),
                exporter: Arc::new(JsonLinesExporter),
            }),
        })
    }

    /// The server's bound address (differs from the configured one when port is 0)
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process ends.
    pub async fn serve(self) -> ServerResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then drop every connection and clear the cache.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> ServerResult<()> {
        info!(address = ?self.listener.local_addr().ok(), "Query server listening");
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&self.context);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, context).await {
                                error!(%peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
                // Reap finished connection tasks so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(connections = connections.len(), "Shutting down query server");
        connections.abort_all();
        self.context.engine.cache().clear();
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<SessionContext>) -> ServerResult<()> {
    let peer_name = peer.to_string();
    SessionMetrics::connection_opened(&peer_name);

    let (reader, mut writer) = stream.into_split();
    let (block_tx, mut block_rx) = mpsc::channel::<ResponseBlock>(WRITER_QUEUE);

    let mut writer_handle = tokio::spawn(async move {
        while let Some(block) = block_rx.recv().await {
            if writer.write_all(block.encode().as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut sessions: HashMap<String, SessionHandle> = HashMap::new();
    let read_result = read_requests(reader, &context, &block_tx, &mut sessions).await;
    let session_count = sessions.len();

    // Input is over. Closing each session's queue lets queued requests finish;
    // whatever is still running after the grace period is abandoned.
    let mut tasks: Vec<JoinHandle<()>> = sessions.into_values().map(|session| session.task).collect();
    drop(block_tx);

    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        for task in tasks.iter_mut() {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!(%peer, "Abandoning in-flight sessions");
        for task in &tasks {
            task.abort();
        }
    }
    if tokio::time::timeout(DISCONNECT_GRACE, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    SessionMetrics::connection_closed(&peer_name, session_count);
    debug!(%peer, "Connection closed");
    read_result
}

/// One decoded request line as handed to a session
#[derive(Debug)]
enum SessionInput {
    Query(String),
    /// The line could be routed but its query text is not valid UTF-8
    Undecodable(String),
}

/// Route a raw line to its token. `None` for blank or unroutable lines.
fn decode_line(raw: &[u8]) -> Option<(String, SessionInput)> {
    match std::str::from_utf8(raw) {
        Ok(line) => RequestLine::parse(line).map(|request| (request.token, SessionInput::Query(request.query))),
        Err(err) => {
            let lossy = String::from_utf8_lossy(raw);
            let request = RequestLine::parse(&lossy)?;
            if request.token.contains(char::REPLACEMENT_CHARACTER) {
                warn!(bytes = raw.len(), "Dropping request line with an undecodable token");
                return None;
            }
            let message = format!("request is not valid UTF-8 (byte {})", err.valid_up_to());
            Some((request.token, SessionInput::Undecodable(message)))
        }
    }
}

async fn read_requests(
    reader: tokio::net::tcp::OwnedReadHalf,
    context: &Arc<SessionContext>,
    block_tx: &mpsc::Sender<ResponseBlock>,
    sessions: &mut HashMap<String, SessionHandle>,
) -> ServerResult<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let Some((token, input)) = decode_line(&buf) else {
            continue;
        };

        let session = sessions
            .entry(token.clone())
            .or_insert_with(|| spawn_session(token.clone(), context, block_tx));
        if session.queries.send(input).is_err() {
            // Only happens once the writer is gone.
            warn!(token = %token, "Session no longer accepts requests");
        }
    }
}

fn spawn_session(
    token: String,
    context: &Arc<SessionContext>,
    block_tx: &mpsc::Sender<ResponseBlock>,
) -> SessionHandle {
    let (queries, query_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_session(token, query_rx, Arc::clone(context), block_tx.clone()));
    SessionHandle { queries, task }
}

fn transition(token: &str, state: &mut SessionState, next: SessionState) {
    debug!(token, from = %state, to = %next, "Session state");
    *state = next;
}

/// Serve every line of one token, in order.
///
/// `exit` closes the current session; the token's next line opens a fresh one
/// on the same task, so the token's responses never overtake each other.
async fn run_session(
    token: String,
    mut queries: mpsc::UnboundedReceiver<SessionInput>,
    context: Arc<SessionContext>,
    out: mpsc::Sender<ResponseBlock>,
) {
    while let Some(first) = queries.recv().await {
        if !serve_session(&token, first, &mut queries, &context, &out).await {
            break;
        }
    }
}

/// Run one session from its first request. Returns `true` when it ended with `exit`.
async fn serve_session(
    token: &str,
    first: SessionInput,
    queries: &mut mpsc::UnboundedReceiver<SessionInput>,
    context: &SessionContext,
    out: &mpsc::Sender<ResponseBlock>,
) -> bool {
    SessionMetrics::session_opened(token);
    let mut state = SessionState::AwaitingQuery;
    let mut exited = false;
    let mut next = Some(first);

    while let Some(input) = next.take() {
        transition(token, &mut state, SessionState::Evaluating);
        let (block, closing) = respond(token, input, context).await;

        transition(token, &mut state, SessionState::StreamingResult);
        if out.send(block).await.is_err() {
            break;
        }
        if closing {
            exited = true;
            break;
        }
        transition(token, &mut state, SessionState::AwaitingQuery);
        next = queries.recv().await;
    }

    transition(token, &mut state, SessionState::Closed);
    exited
}

async fn respond(token: &str, input: SessionInput, context: &SessionContext) -> (ResponseBlock, bool) {
    let text = match input {
        SessionInput::Query(text) => text,
        SessionInput::Undecodable(message) => {
            SessionMetrics::session_error(token, "encoding");
            QueryMetrics::record_query(QueryOutcome::Rejected, std::time::Duration::ZERO, 0);
            return (ResponseBlock::error(token, message), false);
        }
    };

    match context.parser.parse(&text) {
        Ok(Request::Exit) => (ResponseBlock::closed(token), true),
        Ok(Request::Ready) => (ResponseBlock::ready(token), false),
        Ok(Request::Stats) => (stats_block(token, context), false),
        Ok(Request::Query(query)) => {
            let descriptor = QueryDescriptor::new(text.as_str());
            let result = context.engine.evaluate(&descriptor, &query).await;
            let block = ResponseBlock::result(token, &result.graph, context.exporter.as_ref())
                .unwrap_or_else(|e| ResponseBlock::error(token, e.to_string()));
            (block, false)
        }
        Err(e) => {
            SessionMetrics::session_error(token, e.kind());
            QueryMetrics::record_query(QueryOutcome::Rejected, std::time::Duration::ZERO, 0);
            (ResponseBlock::error(token, e.to_string()), false)
        }
    }
}

fn stats_block(token: &str, context: &SessionContext) -> ResponseBlock {
    match serde_json::to_string(&context.engine.stats()) {
        Ok(json) => ResponseBlock::stats(token, &json),
        Err(e) => ResponseBlock::error(token, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::AwaitingQuery.to_string(), "AWAITING_QUERY");
        assert_eq!(SessionState::StreamingResult.to_string(), "STREAMING_RESULT");
        assert_eq!(SessionState::Closed.to_string(), "CLOSED");
    }

    #[test]
    fn test_decode_line_routes_valid_text() {
        let (token, input) = decode_line(b"t1 stats\r\n").unwrap();
        assert_eq!(token, "t1");
        assert!(matches!(input, SessionInput::Query(text) if text == "stats"));
        assert!(decode_line(b"   \n").is_none());
    }

    #[test]
    fn test_decode_line_keeps_token_of_undecodable_query() {
        let (token, input) = decode_line(b"bad vertex \xff\xfe\n").unwrap();
        assert_eq!(token, "bad");
        assert!(matches!(input, SessionInput::Undecodable(message) if message.contains("byte 11")));
    }

    #[test]
    fn test_decode_line_drops_undecodable_token() {
        assert!(decode_line(b"\xffbad stats\n").is_none());
    }
}
