//! Query service metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the binary installs a recorder; every call also
//! leaves a `debug!` trace line.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use tracing::debug;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric recording on or off process-wide.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// How a query was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    CacheHit,
    Computed,
    Partial,
    Rejected,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::CacheHit => "cache_hit",
            QueryOutcome::Computed => "computed",
            QueryOutcome::Partial => "partial",
            QueryOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a remote continuation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    Resolved,
    Unreachable,
    TimedOut,
    Failed,
}

impl ContinuationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationOutcome::Resolved => "resolved",
            ContinuationOutcome::Unreachable => "unreachable",
            ContinuationOutcome::TimedOut => "timed_out",
            ContinuationOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for ContinuationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query evaluation metrics
pub struct QueryMetrics;

impl QueryMetrics {
    /// Record one evaluated query
    pub fn record_query(outcome: QueryOutcome, duration: Duration, result_size: usize) {
        debug!(
            outcome = %outcome,
            duration_ms = duration.as_secs_f64() * 1000.0,
            result_size,
            "Query evaluated"
        );
        if !is_enabled() {
            return;
        }
        counter!("provenance_queries_total", 1, "outcome" => outcome.as_str());
        histogram!("provenance_query_duration_seconds", duration.as_secs_f64(), "outcome" => outcome.as_str());
        histogram!("provenance_query_result_elements", result_size as f64);
    }

    /// Record one remote continuation
    pub fn record_continuation(peer: &str, outcome: ContinuationOutcome, duration: Duration) {
        debug!(
            peer,
            outcome = %outcome,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "Continuation finished"
        );
        if !is_enabled() {
            return;
        }
        counter!("provenance_continuations_total", 1, "outcome" => outcome.as_str());
        histogram!("provenance_continuation_duration_seconds", duration.as_secs_f64());
    }

    /// Record a cache write refused or skipped
    pub fn record_cache_write(stored: bool) {
        debug!(stored, "Cache write");
        if !is_enabled() {
            return;
        }
        let result = if stored { "stored" } else { "refused" };
        counter!("provenance_cache_writes_total", 1, "result" => result);
    }
}

/// Session lifecycle metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn connection_opened(peer: &str) {
        debug!(peer, "Connection opened");
        if is_enabled() {
            counter!("provenance_connections_total", 1);
            increment_gauge!("provenance_connections_active", 1.0);
        }
    }

    pub fn connection_closed(peer: &str, sessions: usize) {
        debug!(peer, sessions, "Connection closed");
        if is_enabled() {
            decrement_gauge!("provenance_connections_active", 1.0);
        }
    }

    pub fn session_opened(token: &str) {
        debug!(token, "Session opened");
        if is_enabled() {
            counter!("provenance_sessions_total", 1);
        }
    }

    pub fn session_error(token: &str, kind: &'static str) {
        debug!(token, kind, "Session error reported");
        if is_enabled() {
            counter!("provenance_session_errors_total", 1, "kind" => kind);
        }
    }
}
