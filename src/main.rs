//! Vehicle sync host - authoritative simulation server
//!
//! Serves `GET /health` and the `/ws` session protocol.

use tokio::net::TcpListener;
use tracing::info;

use vehicle_sync::app::AppState;
use vehicle_sync::config::Config;
use vehicle_sync::game::HostSimulation;
use vehicle_sync::http::build_router;
use vehicle_sync::util::logging::init_tracing;
use vehicle_sync::util::shutdown::shutdown_channel;
use vehicle_sync::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    init_server_time();

    info!(
        tick_rate = config.tick_rate,
        snapshot_rate = config.snapshot_rate,
        props = config.prop_count,
        "Starting vehicle sync host"
    );

    let (host, handle, commands) = HostSimulation::new(&config);
    let mut server_shutdown = shutdown_channel();
    let sim_shutdown = server_shutdown.clone();
    let simulation = tokio::spawn(host.run(commands, sim_shutdown));

    let addr = config.server_addr;
    let router = build_router(AppState::new(config, handle));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening (health at /health, sessions at /ws)");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    // Sessions are closed by the simulation on its way out
    simulation.await?;
    info!("Host stopped");
    Ok(())
}
