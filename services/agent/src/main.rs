//! fluxlb agent
//!
//! Registers this host with a balancer and stays registered until
//! interrupted, at which point it deregisters.

use anyhow::{Context, Result};
use fluxlb_agent::{register, AgentConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLUXLB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fluxlb agent");
    info!(
        name = %config.name,
        balancer_addr = %config.balancer_addr,
        data_addr = %config.data_addr(),
        health_interval_secs = config.health_interval.as_secs(),
        "Configuration loaded"
    );

    let (agent, mut data) = register(config)
        .await
        .context("registration with balancer failed")?;

    tokio::spawn(async move {
        let mut packets: u64 = 0;
        while let Some(packet) = data.recv().await {
            packets += 1;
            debug!(len = packet.len(), packets, "Packet received");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            if let Err(e) = agent.deregister().await {
                warn!(error = %e, "Deregistration failed");
            }
        }
        _ = agent.closed() => {
            warn!("Balancer ended the registration");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}
