use anyhow::{Context, Result};
use provenance_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from the optional config file and environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    // Set up monitoring
    provenance_monitoring::init(config.monitoring()).context("Failed to initialize monitoring")?;

    // Run the server using the library's run function
    provenance_server::run(config).await.context("Server error")?;

    provenance_monitoring::shutdown();
    Ok(())
}
