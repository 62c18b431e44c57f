//! Headless vehicle sync client
//!
//! Connects to the host when it is reachable, otherwise drives a local
//! offline world, and logs status and the player's pose once a second.

use tracing::info;

use vehicle_sync::client::{ClientRunner, ScriptedInput};
use vehicle_sync::config::ClientConfig;
use vehicle_sync::util::logging::init_tracing;
use vehicle_sync::util::shutdown::shutdown_channel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ClientConfig::from_env()?;
    init_tracing(&config.log_level);

    info!(host = %config.host_url, "Starting vehicle sync client");

    let mut runner = ClientRunner::new(config, ScriptedInput)?;
    runner.run(shutdown_channel()).await;
    Ok(())
}
