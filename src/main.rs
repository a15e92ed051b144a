//! Standalone gateway binary
//!
//! Configuration comes from the YAML file named by `GATEWAY_CONFIG` (if set),
//! then `GATEWAY_HOST` / `GATEWAY_PORT` overrides. Log filtering follows
//! `RUST_LOG`, defaulting to `info`.

use anyhow::Result;
use gateway::config::GatewayConfig;
use gateway::server::Gateway;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("GATEWAY_CONFIG") {
        Ok(path) => GatewayConfig::from_yaml_file(&path)?,
        Err(_) => GatewayConfig::default(),
    }
    .with_overrides(|key| std::env::var(key).ok())?;

    let gateway = Gateway::bind(config).await?;

    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
