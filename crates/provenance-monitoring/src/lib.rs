//! Monitoring for the provenance query service: structured logging setup and
//! query metrics.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to log output
    pub service_name: String,
    /// Log level filter (e.g., "info,provenance_server=debug"); `RUST_LOG` wins when set
    pub log_filter: String,
    /// Emit JSON log lines instead of pretty output
    pub json_logs: bool,
    /// Record metrics through the `metrics` facade
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "provenance".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
            enable_metrics: true,
        }
    }
}

/// Initialize monitoring system
pub fn init(config: MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(&config)?;
    metrics::set_enabled(config.enable_metrics);

    info!(
        service_name = %config.service_name,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(())
}

/// Shutdown the monitoring system
pub fn shutdown() {
    info!("Shutting down monitoring system");
}


// Exported types
pub use crate::metrics::{ContinuationOutcome, QueryMetrics, QueryOutcome, SessionMetrics};
