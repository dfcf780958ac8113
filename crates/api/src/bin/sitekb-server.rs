use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sitekb_api::{build_state, run};
use sitekb_common::SystemConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SystemConfig::from_env().context("failed to load configuration")?;
    let (state, background_cancel) = build_state(&config).await?;

    info!(model = ?config.embedding.model, "knowledge base engine ready");
    let result = run(state, &config.server.bind_addr).await;
    background_cancel.cancel();
    result
}
