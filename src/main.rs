use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use socp::config::Config;
use socp::node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("socp=info")),
        )
        .init();

    let cfg = Config::parse();
    let handle = node::spawn(cfg).await?;
    info!("node {} is up on {}", handle.server_id(), handle.local_addr);

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
