mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use provenance_graph::{Direction, Graph, QueryDescriptor, Vertex};
use provenance_server::{
    ContinuationError, ContinuationParams, ContinuationResolver, EngineConfig,
};

use common::{artifact, edge, engine_with, network, parse, process, remote_resolver, TestNode};

mock! {
    pub Resolver {}

    #[async_trait]
    impl ContinuationResolver for Resolver {
        async fn resolve(&self, boundary: &Vertex, params: &ContinuationParams) -> Result<Graph, ContinuationError>;
    }
}

fn params(direction: Direction, depth: u32) -> ContinuationParams {
    ContinuationParams {
        direction,
        depth,
        descriptor: QueryDescriptor::from("test"),
    }
}

/// A port with nothing listening on it
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_descendants_continue_on_peer() {
    // Receiving host: the socket feeds a daemon that writes a file.
    let remote = TestNode::start(engine_with(
        remote_resolver(Duration::from_secs(2)),
        EngineConfig::default(),
    ))
    .await;
    let socket = network(remote.addr.port(), "10.0.0.1:5000->10.0.0.2:22");
    let daemon = process("sshd");
    let payload = artifact("/tmp/payload");
    remote.store().put_vertex(socket.clone());
    remote.store().put_vertex(daemon.clone());
    remote.store().put_vertex(payload.clone());
    remote.store().put_edge(edge(&socket, &daemon, "Used"));
    remote.store().put_edge(edge(&daemon, &payload, "WasGeneratedBy"));

    // Sending host: a client process writes to the socket.
    let local = engine_with(remote_resolver(Duration::from_secs(2)), EngineConfig::default());
    let client = process("scp");
    local.store().put_vertex(client.clone());
    local.store().put_vertex(socket.clone());
    local.store().put_edge(edge(&client, &socket, "WasGeneratedBy"));

    let text = format!("descendants {} 8", client.id());
    let result = local.evaluate(&QueryDescriptor::new(text.as_str()), &parse(&text)).await;

    let graph = result.graph;
    assert!(!graph.is_partial());
    for vertex in [&client, &socket, &daemon, &payload] {
        assert!(graph.contains_vertex(vertex.id()), "missing {}", vertex.id());
    }
    assert_eq!(graph.edge_count(), 3);
    assert_eq!(remote.store().traversal_count(), 1);

    remote.stop().await;
}

#[tokio::test]
async fn test_unreachable_peer_leaves_boundary_unresolved() {
    let engine = engine_with(remote_resolver(Duration::from_secs(2)), EngineConfig::default());
    let client = process("curl");
    let socket = network(closed_port(), "dead peer");
    engine.store().put_vertex(client.clone());
    engine.store().put_vertex(socket.clone());
    engine.store().put_edge(edge(&client, &socket, "WasGeneratedBy"));

    let text = format!("descendants {} 4", client.id());
    let result = engine.evaluate(&QueryDescriptor::new(text.as_str()), &parse(&text)).await;

    assert!(result.graph.is_partial());
    assert!(result.graph.is_unresolved(socket.id()));
    assert!(result.graph.contains_vertex(client.id()));
    assert!(result.graph.contains_vertex(socket.id()));
    assert_eq!(result.graph.edge_count(), 1);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    // Accepts connections (kernel backlog) but never answers.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket = network(silent.local_addr().unwrap().port(), "silent");

    let resolver = common::remote_resolver(Duration::from_millis(150));
    let err = resolver
        .resolve(&socket, &params(Direction::Descendants, 3))
        .await
        .unwrap_err();

    assert!(matches!(err, ContinuationError::Timeout { timeout_ms: 150, .. }), "got {err:?}");
    drop(silent);
}

#[tokio::test]
async fn test_peer_error_line_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket = network(listener.local_addr().unwrap().port(), "grumpy");

    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let request = lines.next_line().await.unwrap().unwrap();
        let (token, query) = request.split_once(' ').unwrap();
        writer
            .write_all(format!("{token} !error no such vertex\n\n").as_bytes())
            .await
            .unwrap();
        query.to_string()
    });

    let resolver = remote_resolver(Duration::from_secs(2));
    let err = resolver
        .resolve(&socket, &params(Direction::Ancestors, 6))
        .await
        .unwrap_err();

    match err {
        ContinuationError::Peer { message, .. } => assert_eq!(message, "no such vertex"),
        other => panic!("expected peer error, got {other:?}"),
    }
    assert_eq!(peer.await.unwrap(), format!("ancestors {} 6", socket.id()));
}

#[tokio::test]
async fn test_misrouted_response_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket = network(listener.local_addr().unwrap().port(), "confused");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let _ = lines.next_line().await;
        let _ = writer.write_all(b"someone-else !result 0 0 0\n\n").await;
    });

    let err = remote_resolver(Duration::from_secs(2))
        .resolve(&socket, &params(Direction::Descendants, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, ContinuationError::Protocol { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_non_boundary_vertex_is_refused() {
    let err = remote_resolver(Duration::from_secs(1))
        .resolve(&process("local only"), &params(Direction::Descendants, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, ContinuationError::NotABoundary(_)));
}

#[tokio::test]
async fn test_mock_resolver_receives_remaining_depth() {
    let client = process("rsync");
    let near = network(4000, "near");
    let far = network(4001, "far");
    let hop = process("relay");
    let remote_file = artifact("/srv/remote");

    let mut resolver = MockResolver::new();
    let near_id = near.id().clone();
    let remote_part = {
        let mut graph = Graph::new();
        graph.put_vertex(near.clone());
        graph.put_vertex(remote_file.clone());
        graph.put_edge(edge(&near, &remote_file, "Used"));
        graph
    };
    resolver
        .expect_resolve()
        .withf(move |boundary, params| {
            boundary.id() == &near_id && params.depth == 4 && params.direction == Direction::Descendants
        })
        .times(1)
        .returning(move |_, _| Ok(remote_part.clone()));
    let far_id = far.id().clone();
    resolver
        .expect_resolve()
        .withf(move |boundary, params| boundary.id() == &far_id && params.depth == 3)
        .times(1)
        .returning(|boundary, _| {
            Err(ContinuationError::Unreachable {
                peer: boundary.id().to_string(),
                reason: "refused".to_string(),
            })
        });

    let engine = engine_with(Arc::new(resolver), EngineConfig::default());
    for vertex in [&client, &near, &far, &hop] {
        engine.store().put_vertex(vertex.clone());
    }
    engine.store().put_edge(edge(&client, &near, "WasGeneratedBy"));
    engine.store().put_edge(edge(&client, &hop, "WasTriggeredBy"));
    engine.store().put_edge(edge(&hop, &far, "WasGeneratedBy"));

    let text = format!("descendants {} 5", client.id());
    let result = engine.evaluate(&QueryDescriptor::new(text.as_str()), &parse(&text)).await;

    assert!(result.graph.contains_vertex(remote_file.id()));
    assert!(!result.graph.is_unresolved(near.id()));
    assert!(result.graph.is_unresolved(far.id()));
    assert_eq!(result.graph.unresolved().count(), 1);
    assert_eq!(result.graph.edge_count(), 4);
}

#[tokio::test]
async fn test_boundary_without_depth_left_is_not_resolved() {
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().never();

    let engine = engine_with(Arc::new(resolver), EngineConfig::default());
    let client = process("ping");
    let socket = network(4000, "edge of depth");
    engine.store().put_vertex(client.clone());
    engine.store().put_vertex(socket.clone());
    engine.store().put_edge(edge(&client, &socket, "WasGeneratedBy"));

    let text = format!("descendants {} 1", client.id());
    let result = engine.evaluate(&QueryDescriptor::new(text.as_str()), &parse(&text)).await;

    assert!(result.graph.contains_vertex(socket.id()));
    assert!(!result.graph.is_partial());
}

#[tokio::test]
async fn test_partial_results_expire_sooner() {
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().times(2).returning(|boundary, _| {
        Err(ContinuationError::Unreachable {
            peer: boundary.id().to_string(),
            reason: "down".to_string(),
        })
    });

    let config = EngineConfig {
        partial_result_ttl: chrono::Duration::milliseconds(20),
        ..EngineConfig::default()
    };
    let engine = engine_with(Arc::new(resolver), config);
    let client = process("nc");
    let socket = network(4000, "flaky");
    engine.store().put_vertex(client.clone());
    engine.store().put_vertex(socket.clone());
    engine.store().put_edge(edge(&client, &socket, "WasGeneratedBy"));

    let text = format!("descendants {} 3", client.id());
    let descriptor = QueryDescriptor::new(text.as_str());
    let query = parse(&text);

    let first = engine.evaluate(&descriptor, &query).await;
    assert!(first.graph.is_partial());
    assert!(!first.cached);

    tokio::time::sleep(Duration::from_millis(60)).await;

    let second = engine.evaluate(&descriptor, &query).await;
    assert!(!second.cached);
    assert_eq!(engine.store().traversal_count(), 2);
}

/// Resolver that records how many continuations run at once.
struct SlowResolver {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ContinuationResolver for SlowResolver {
    async fn resolve(&self, boundary: &Vertex, _params: &ContinuationParams) -> Result<Graph, ContinuationError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let mut graph = Graph::new();
        graph.put_vertex(boundary.clone());
        Ok(graph)
    }
}

#[tokio::test]
async fn test_fanout_is_capped() {
    let resolver = Arc::new(SlowResolver {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        max_continuation_fanout: 2,
        ..EngineConfig::default()
    };
    let engine = engine_with(resolver.clone(), config);

    let client = process("fan");
    engine.store().put_vertex(client.clone());
    for n in 0..6 {
        let socket = network(5000 + n, &format!("conn-{n}"));
        engine.store().put_vertex(socket.clone());
        engine.store().put_edge(edge(&client, &socket, "WasGeneratedBy"));
    }

    let text = format!("descendants {} 2", client.id());
    let result = engine.evaluate(&QueryDescriptor::new(text.as_str()), &parse(&text)).await;

    assert_eq!(result.graph.vertex_count(), 7);
    assert!(!result.graph.is_partial());
    assert_eq!(resolver.peak.load(Ordering::SeqCst), 2);
}
