//! fluxlb balancer
//!
//! Front node of the load balancer. This binary:
//! - Accepts backend registrations on the control listener
//! - Maintains the consistent hash table of live backends
//! - Forwards intercepted packets to the backend owning their flow
//! - Deregisters every backend on shutdown (SIGINT/SIGTERM)

use std::sync::Arc;

use anyhow::{Context, Result};
use fluxlb_balancer::{
    Balancer, Config, Interceptor, NoopInterceptor, UdpForwarderFactory, UdpTapInterceptor,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLUXLB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fluxlb balancer");
    info!(
        control_addr = %config.control_addr,
        data_port = config.data_port,
        table_capacity = config.table_capacity,
        workers = config.workers,
        queue_depth = config.queue_depth,
        "Configuration loaded"
    );

    let interceptor: Arc<dyn Interceptor> = match config.tap_addr {
        Some(addr) => Arc::new(
            UdpTapInterceptor::bind(addr)
                .await
                .with_context(|| format!("failed to bind packet tap on {}", addr))?,
        ),
        None => {
            info!("No packet tap configured, running control plane only");
            Arc::new(NoopInterceptor)
        }
    };

    let forwarders = Arc::new(UdpForwarderFactory::new(config.data_port));
    let balancer = Balancer::start(&config, forwarders, interceptor).await?;

    shutdown_signal().await;
    info!("Received shutdown signal");

    balancer.shutdown().await;
    info!("Balancer shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
