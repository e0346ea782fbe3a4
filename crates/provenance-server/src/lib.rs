//!
//! Provenance Server - distributed provenance query service
//!
//! Every node answers lineage queries over its own graph and acts as a client
//! of its peers when a lineage crosses a network boundary.

// External dependencies
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use provenance_graph::{GraphRecord, GraphStore, QueryCache};

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Query language module
pub mod query;

/// Session wire format module
pub mod protocol;

/// Remote continuation module
pub mod continuation;

/// Query evaluation module
pub mod engine;

/// Server module
pub mod server;

// Re-export key types
pub use config::ServerConfig;
pub use continuation::{
    ContinuationParams, ContinuationResolver, RemoteContinuationResolver, RemoteResolverConfig,
};
pub use engine::{EngineConfig, EngineStats, QueryEngine, QueryResult};
pub use error::{ContinuationError, ProtocolError, QueryError, ServerError, ServerResult};
pub use server::{QueryServer, SessionState};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let engine = create_engine(&config)?;

    let server = QueryServer::bind(&config, engine).await?;
    info!(address = %server.local_addr()?, "Provenance server started");

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}

/// Create the cache, the store (seeded when configured) and the engine
pub fn create_engine(config: &ServerConfig) -> ServerResult<Arc<QueryEngine>> {
    let cache = Arc::new(QueryCache::new(config.cache_capacity));
    let store = Arc::new(GraphStore::new().with_cache(cache.clone()));

    if let Some(path) = &config.seed_file {
        load_seed(&store, path)?;
    }

    let resolver = Arc::new(RemoteContinuationResolver::new(RemoteResolverConfig {
        timeout: config.continuation_timeout(),
        default_port: config.peer_query_port,
    }));

    Ok(Arc::new(QueryEngine::new(
        store,
        cache,
        resolver,
        EngineConfig::from(config),
    )))
}

/// Load a JSON-lines file of graph records into `store`. Returns the number of new elements.
pub fn load_seed(store: &GraphStore, path: &Path) -> ServerResult<usize> {
    let seed_error = |reason: String| ServerError::Seed {
        path: path.display().to_string(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| seed_error(e.to_string()))?;
    let records = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            GraphRecord::decode(line).map_err(|e| seed_error(format!("line {}: {}", number + 1, e)))
        })
        .collect::<ServerResult<Vec<_>>>()?;

    Ok(store.load(records))
}
