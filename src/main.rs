//! capgated - capability gate daemon.

use anyhow::Context;
use capgate::config::{Config, validate};
use capgate::server::Server;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "capgate.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config {config_path}"))?;

    capgate::telemetry::init(config.logging.format);

    if let Err(errors) = validate(&config) {
        for e in &errors {
            error!(error = %e, "invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {config_path}", errors.len());
    }

    let server = Server::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown();
    Ok(())
}
