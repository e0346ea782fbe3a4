//! Configuration for the provenance query server
//!
//! Defaults, then an optional YAML file named by `PROVENANCE_CONFIG`, then
//! `PROVENANCE_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use provenance_monitoring::MonitoringConfig;

use crate::error::{ServerError, ServerResult};

/// Environment variable naming an optional YAML configuration file
pub const CONFIG_FILE_ENV: &str = "PROVENANCE_CONFIG";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on for query sessions
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Lifetime of a cached complete result
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Lifetime of a cached result with unresolved continuations
    #[serde(default = "default_partial_result_ttl_ms")]
    pub partial_result_ttl_ms: u64,

    /// Maximum number of cached query results
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Per-continuation connect and response timeout
    #[serde(default = "default_continuation_timeout_ms")]
    pub continuation_timeout_ms: u64,

    /// Largest depth a query may request
    #[serde(default = "default_max_traversal_depth")]
    pub max_traversal_depth: u32,

    /// Depth used when a query does not give one
    #[serde(default = "default_traversal_depth")]
    pub default_traversal_depth: u32,

    /// Maximum concurrent continuations per query
    #[serde(default = "default_max_continuation_fanout")]
    pub max_continuation_fanout: usize,

    /// Query port assumed for peers whose network vertex does not carry one
    #[serde(default = "default_port")]
    pub peer_query_port: u16,

    /// Log level filter
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// JSON-lines file of vertex/edge records loaded at startup
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    3333
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_partial_result_ttl_ms() -> u64 {
    5_000
}

fn default_cache_capacity() -> usize {
    provenance_graph::DEFAULT_CACHE_CAPACITY
}

fn default_continuation_timeout_ms() -> u64 {
    5_000
}

fn default_max_traversal_depth() -> u32 {
    64
}

fn default_traversal_depth() -> u32 {
    16
}

fn default_max_continuation_fanout() -> usize {
    8
}

fn default_log_filter() -> String {
    "info,provenance_server=debug".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            cache_ttl_ms: default_cache_ttl_ms(),
            partial_result_ttl_ms: default_partial_result_ttl_ms(),
            cache_capacity: default_cache_capacity(),
            continuation_timeout_ms: default_continuation_timeout_ms(),
            max_traversal_depth: default_max_traversal_depth(),
            default_traversal_depth: default_traversal_depth(),
            max_continuation_fanout: default_max_continuation_fanout(),
            peer_query_port: default_port(),
            log_filter: default_log_filter(),
            json_logs: false,
            seed_file: None,
        }
    }
}

/// Parse `key` into `target`, keeping the current value on failure.
fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the optional config file and environment variables
    pub fn load() -> ServerResult<Self> {
        let mut config = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ServerError::Config(format!("cannot read {path}: {e}")))?;
                info!(path = %path, "Reading configuration file");
                Self::from_yaml_str(&text)?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!("Loaded server configuration");
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(text: &str) -> ServerResult<Self> {
        serde_yaml::from_str(text).map_err(|e| ServerError::Config(format!("invalid configuration file: {e}")))
    }

    /// Apply `PROVENANCE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_parsed(&lookup, "PROVENANCE_PORT", &mut self.port);
        if let Some(host) = lookup("PROVENANCE_BIND_ADDRESS") {
            self.bind_address = host;
        }
        override_parsed(&lookup, "PROVENANCE_CACHE_TTL_MS", &mut self.cache_ttl_ms);
        override_parsed(&lookup, "PROVENANCE_PARTIAL_TTL_MS", &mut self.partial_result_ttl_ms);
        override_parsed(&lookup, "PROVENANCE_CACHE_CAPACITY", &mut self.cache_capacity);
        override_parsed(&lookup, "PROVENANCE_CONTINUATION_TIMEOUT_MS", &mut self.continuation_timeout_ms);
        override_parsed(&lookup, "PROVENANCE_MAX_DEPTH", &mut self.max_traversal_depth);
        override_parsed(&lookup, "PROVENANCE_DEFAULT_DEPTH", &mut self.default_traversal_depth);
        override_parsed(&lookup, "PROVENANCE_MAX_FANOUT", &mut self.max_continuation_fanout);
        override_parsed(&lookup, "PROVENANCE_PEER_PORT", &mut self.peer_query_port);
        if let Some(filter) = lookup("PROVENANCE_LOG_FILTER") {
            self.log_filter = filter;
        }
        override_parsed(&lookup, "PROVENANCE_JSON_LOGS", &mut self.json_logs);
        if let Some(path) = lookup("PROVENANCE_SEED_FILE") {
            self.seed_file = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.cache_capacity == 0 {
            return Err(ServerError::Config("cache_capacity must be greater than zero".to_string()));
        }
        if self.continuation_timeout_ms == 0 {
            return Err(ServerError::Config(
                "continuation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_traversal_depth == 0 {
            return Err(ServerError::Config(
                "max_traversal_depth must be greater than zero".to_string(),
            ));
        }
        if self.default_traversal_depth > self.max_traversal_depth {
            return Err(ServerError::Config(format!(
                "default_traversal_depth {} exceeds max_traversal_depth {}",
                self.default_traversal_depth, self.max_traversal_depth
            )));
        }
        if self.max_continuation_fanout == 0 {
            return Err(ServerError::Config(
                "max_continuation_fanout must be greater than zero".to_string(),
            ));
        }
        if self.partial_result_ttl_ms > self.cache_ttl_ms {
            warn!(
                partial_result_ttl_ms = self.partial_result_ttl_ms,
                cache_ttl_ms = self.cache_ttl_ms,
                "Partial results outlive complete results in the cache"
            );
        }
        Ok(())
    }

    /// Address string the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        ttl_from_millis(self.cache_ttl_ms)
    }

    pub fn partial_result_ttl(&self) -> chrono::Duration {
        ttl_from_millis(self.partial_result_ttl_ms)
    }

    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_millis(self.continuation_timeout_ms)
    }

    /// Monitoring settings derived from this configuration
    pub fn monitoring(&self) -> MonitoringConfig {
        MonitoringConfig {
            service_name: "provenance-server".to_string(),
            log_filter: self.log_filter.clone(),
            json_logs: self.json_logs,
            enable_metrics: true,
        }
    }
}

/// Millisecond settings beyond `i64::MAX` saturate instead of wrapping negative.
fn ttl_from_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
