//! Shared fixtures for the server integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use provenance_graph::{Edge, GraphStore, QueryCache, Vertex};
use provenance_server::query::{Query, QueryParser, Request};
use provenance_server::{
    ContinuationResolver, EngineConfig, QueryEngine, QueryServer, RemoteContinuationResolver,
    RemoteResolverConfig, ServerConfig,
};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn process(name: &str) -> Vertex {
    Vertex::from_pairs([("type", "Process"), ("name", name)]).unwrap()
}

pub fn artifact(path: &str) -> Vertex {
    Vertex::from_pairs([("type", "Artifact"), ("path", path)]).unwrap()
}

/// Network vertex pointing at a query server on localhost
pub fn network(query_port: u16, label: &str) -> Vertex {
    let port = query_port.to_string();
    Vertex::from_pairs([
        ("type", "Network"),
        ("remote address", "127.0.0.1"),
        ("remote query port", port.as_str()),
        ("connection", label),
    ])
    .unwrap()
}

pub fn edge(from: &Vertex, to: &Vertex, kind: &str) -> Edge {
    Edge::between(from, to, [("type", kind)]).unwrap()
}

pub fn parse(text: &str) -> Query {
    match QueryParser::new(16, 64).parse(text) {
        Ok(Request::Query(query)) => query,
        other => panic!("expected a query, got {other:?}"),
    }
}

pub fn remote_resolver(timeout: Duration) -> Arc<dyn ContinuationResolver> {
    Arc::new(RemoteContinuationResolver::new(RemoteResolverConfig {
        timeout,
        default_port: 1,
    }))
}

pub fn engine_with(resolver: Arc<dyn ContinuationResolver>, config: EngineConfig) -> Arc<QueryEngine> {
    let cache = Arc::new(QueryCache::new(64));
    let store = Arc::new(GraphStore::new().with_cache(cache.clone()));
    Arc::new(QueryEngine::new(store, cache, resolver, config))
}

/// A query server running on an ephemeral loopback port
pub struct TestNode {
    pub addr: SocketAddr,
    pub engine: Arc<QueryEngine>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestNode {
    pub async fn start(engine: Arc<QueryEngine>) -> Self {
        let config = ServerConfig {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        };
        let server = QueryServer::bind(&config, engine.clone()).await.expect("bind");
        let addr = server.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve_until(async {
                    let _ = rx.await;
                })
                .await
                .expect("serve");
        });
        Self {
            addr,
            engine,
            shutdown: Some(tx),
            handle,
        }
    }

    pub fn store(&self) -> &GraphStore {
        self.engine.store()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

/// Line-oriented protocol client
pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, token: &str, query: &str) {
        self.send_raw(&format!("{token} {query}\n")).await;
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.send_bytes(raw.as_bytes()).await;
    }

    pub async fn send_bytes(&mut self, raw: &[u8]) {
        self.writer.write_all(raw).await.expect("write");
    }

    /// Half-close: no more requests, responses still readable.
    pub async fn finish(&mut self) {
        self.writer.shutdown().await.expect("shutdown");
    }

    /// Next raw line, or `None` once the server closed the connection.
    pub async fn read_line(&mut self) -> Option<String> {
        tokio::time::timeout(IO_TIMEOUT, self.lines.next_line())
            .await
            .expect("response timed out")
            .expect("read")
    }

    /// Read one response block; every line of it carries the same token.
    pub async fn read_block(&mut self) -> (String, Vec<String>) {
        tokio::time::timeout(IO_TIMEOUT, async {
            let mut token: Option<String> = None;
            let mut payloads = Vec::new();
            loop {
                let line = self
                    .lines
                    .next_line()
                    .await
                    .expect("read")
                    .expect("connection closed mid-response");
                if line.is_empty() {
                    break;
                }
                let (line_token, payload) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                match &token {
                    Some(expected) => assert_eq!(expected, line_token, "block mixes tokens"),
                    None => token = Some(line_token.to_string()),
                }
                payloads.push(payload.to_string());
            }
            (token.expect("empty response block"), payloads)
        })
        .await
        .expect("response timed out")
    }
}
