//! Binary entrypoint for the toolflow API server.
use anyhow::Context;
use toolflow_api::{run, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("failed to read server configuration")?;
    run(config).await.context("API server stopped")?;
    Ok(())
}
