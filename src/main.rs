use std::env;
use std::sync::Arc;

use market_dwh::{utils::logging, Dwh, DwhConfigBuilder};

/// Binary entry point. Configuration comes from the environment (with
/// `.env` support); the chain gateway is wired in by the deployment, so a
/// bare start runs in query-only mode.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let mut builder = DwhConfigBuilder::new().with_storage(
        env::var("DWH_STORAGE_DRIVER")?,
        env::var("DWH_STORAGE_ENDPOINT")?,
    );
    if let Ok(level) = env::var("DWH_LOG_LEVEL") {
        builder = builder.with_logging_level(level);
    }
    if let Ok(endpoint) = env::var("DWH_BLOCKCHAIN_ENDPOINT") {
        builder = builder.with_blockchain(endpoint);
    }
    if let Ok(up_to_block) = env::var("DWH_COLD_START_UP_TO_BLOCK") {
        builder = builder.with_cold_start(up_to_block.parse()?);
    }
    let config = builder.build()?;

    logging::init(&config.logging.level)?;

    let dwh = Arc::new(Dwh::new(config, None).await?);

    let server = tokio::spawn(dwh.clone().serve());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    dwh.stop().await;

    server.await??;
    Ok(())
}
