//! Enclave - Transit Encryption Service
//!
//! Main entry point. Initializes structured JSON logging, loads the
//! environment-driven configuration, and runs the server lifecycle until a
//! shutdown signal arrives.

use enclave::{Config, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    tracing::info!(
        version = enclave::VERSION,
        api_addr = %config.api_addr,
        peer_addr = %config.peer_addr,
        "starting transit encryption service"
    );

    Server::new(config).run().await?;

    tracing::info!("transit encryption service stopped");
    Ok(())
}
