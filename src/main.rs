use std::sync::Arc;

use anyhow::Result;
use log::info;
use perpbot::{Config, LiveRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cfg = Config::from_env();
    cfg.validate_live()?;

    info!(
        "Starting trading engine (testnet={}, symbols={:?}, interval={})",
        cfg.is_testnet, cfg.symbols, cfg.candle_interval
    );

    let runtime = Arc::new(LiveRuntime::new(cfg));
    runtime.initialize().await?;
    runtime.start().await?;

    tokio::signal::ctrl_c().await?;
    runtime.stop();
    Ok(())
}
