//! Query evaluation: cache check, local traversal, concurrent remote
//! continuation, set composition and cache write-back.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use provenance_graph::{
    BoundaryHit, CacheMetrics, CacheWrite, Direction, Graph, GraphStore, QueryCache, QueryDescriptor,
    StoreStats, TraversalOutcome,
};
use provenance_monitoring::{QueryMetrics, QueryOutcome};

use crate::config::ServerConfig;
use crate::continuation::{ContinuationParams, ContinuationResolver};
use crate::query::{Query, Term};

/// Evaluation settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL of complete results
    pub cache_ttl: Duration,
    /// TTL of results with unresolved continuations
    pub partial_result_ttl: Duration,
    /// Maximum concurrent continuations per traversal
    pub max_continuation_fanout: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for EngineConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            partial_result_ttl: config.partial_result_ttl(),
            max_continuation_fanout: config.max_continuation_fanout.max(1),
        }
    }
}

/// Evaluated query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub graph: Graph,
    /// Served from the cache without evaluation
    pub cached: bool,
}

/// Payload of the `stats` command
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub cache: CacheMetrics,
    pub traversals: u64,
}

/// Evaluates queries against the local store, extending them across hosts.
pub struct QueryEngine {
    store: Arc<GraphStore>,
    cache: Arc<QueryCache>,
    resolver: Arc<dyn ContinuationResolver>,
    config: EngineConfig,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl QueryEngine {
    pub fn new(
        store: Arc<GraphStore>,
        cache: Arc<QueryCache>,
        resolver: Arc<dyn ContinuationResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            resolver,
            config,
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Answer `query`, whose exact text is `descriptor`.
    #[instrument(skip(self, query), fields(descriptor = %descriptor))]
    pub async fn evaluate(&self, descriptor: &QueryDescriptor, query: &Query) -> QueryResult {
        let started = Instant::now();

        if let Some(graph) = self.cache.lookup(descriptor, Utc::now()) {
            QueryMetrics::record_query(QueryOutcome::CacheHit, started.elapsed(), graph.size());
            return QueryResult { graph, cached: true };
        }

        let observed = self.cache.generation();

        let mut graph = self.evaluate_term(&query.first, descriptor).await;
        for (op, term) in &query.rest {
            let operand = self.evaluate_term(term, descriptor).await;
            graph = op.apply(&graph, &operand);
        }

        let partial = graph.is_partial();
        let ttl = if partial {
            self.config.partial_result_ttl
        } else {
            self.config.cache_ttl
        };
        let write = CacheWrite::new(descriptor.clone(), graph.clone(), ttl)
            .with_roots(query.roots())
            .observed_at(observed);
        let stored = self.cache.commit(write, Utc::now());
        QueryMetrics::record_cache_write(stored);

        let outcome = if partial {
            QueryOutcome::Partial
        } else {
            QueryOutcome::Computed
        };
        QueryMetrics::record_query(outcome, started.elapsed(), graph.size());
        debug!(
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            partial,
            stored,
            "Query evaluated"
        );

        QueryResult { graph, cached: false }
    }

    async fn evaluate_term(&self, term: &Term, descriptor: &QueryDescriptor) -> Graph {
        match term {
            Term::Vertex(id) => {
                let mut graph = Graph::new();
                if let Some(vertex) = self.store.vertex(id) {
                    graph.put_vertex(vertex);
                }
                graph
            }
            Term::Lineage(traversal) => {
                let outcome = self.store.traverse(traversal);
                self.continue_remotely(outcome, traversal.direction, descriptor).await
            }
        }
    }

    /// Resolve every boundary with depth left, concurrently up to the fan-out cap,
    /// and splice the remote parts into the local result.
    async fn continue_remotely(
        &self,
        outcome: TraversalOutcome,
        direction: Direction,
        descriptor: &QueryDescriptor,
    ) -> Graph {
        let TraversalOutcome { mut graph, boundaries } = outcome;
        let pending: Vec<BoundaryHit> = boundaries
            .into_iter()
            .filter(|hit| hit.remaining_depth > 0)
            .collect();
        if pending.is_empty() {
            return graph;
        }
        debug!(boundaries = pending.len(), "Continuing traversal remotely");

        let resolved: Vec<_> = stream::iter(pending)
            .map(|hit| {
                let resolver = Arc::clone(&self.resolver);
                let params = ContinuationParams {
                    direction,
                    depth: hit.remaining_depth,
                    descriptor: descriptor.clone(),
                };
                async move {
                    let result = resolver.resolve(&hit.vertex, &params).await;
                    (hit.vertex, result)
                }
            })
            .buffer_unordered(self.config.max_continuation_fanout)
            .collect()
            .await;

        for (boundary, result) in resolved {
            match result {
                Ok(remote) => graph.merge(remote),
                Err(err) => {
                    warn!(boundary = %boundary.id(), error = %err, "Leaving boundary unresolved");
                    graph.mark_unresolved(boundary.id());
                }
            }
        }
        graph
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            cache: self.cache.metrics(),
            traversals: self.store.traversal_count(),
        }
    }
}
