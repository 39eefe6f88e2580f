//! Royale Relay Server
//!
//! Match lobby and UDP relay for Royale2D lockstep matches.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use royale_netcode::{
    network::server::{RelayServer, ServerConfig},
    FRAME_RATE, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    info!("Royale Relay v{}", VERSION);
    info!("Frame Rate: {} Hz", FRAME_RATE);
    info!(
        "Relay ports: {}..{}",
        config.base_udp_port,
        config.base_udp_port.saturating_add(config.max_matches)
    );

    let server = std::sync::Arc::new(RelayServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("relay server failed")?;
    info!("Relay server stopped");
    Ok(())
}
