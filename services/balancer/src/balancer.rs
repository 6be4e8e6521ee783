//! Balancer orchestration.
//!
//! Wires the registry, registration manager, packet pipeline and
//! interceptor together and runs the ordered shutdown sequence:
//!
//! 1. Stop accepting control connections and deregister every session.
//! 2. Close forwarders of any backend still left in the registry.
//! 3. Stop the interceptor feed and drain the pipeline.
//! 4. Release the interceptor (VIP and capture hooks).
//!
//! Each step is bounded by the shutdown grace period. A step that fails or
//! overruns is logged and the sequence continues.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::forwarder::ForwarderFactory;
use crate::interception::Interceptor;
use crate::manager::{ManagerStats, RegistrationManager};
use crate::pipeline::{PacketPipeline, PacketSender, PipelineStats};
use crate::registry::BackendRegistry;

/// A running balancer.
pub struct Balancer {
    registry: Arc<BackendRegistry>,
    control_addr: SocketAddr,
    manager: JoinHandle<std::io::Result<()>>,
    manager_stats: Arc<ManagerStats>,
    control_shutdown: watch::Sender<bool>,
    pipeline: PacketPipeline,
    sender: PacketSender,
    interceptor: Arc<dyn Interceptor>,
    interception: JoinHandle<Result<()>>,
    intercept_shutdown: watch::Sender<bool>,
    shutdown_grace: Duration,
}

impl Balancer {
    /// Start every component. Fails if the table configuration is invalid
    /// or the control listener cannot be bound.
    pub async fn start(
        config: &Config,
        forwarders: Arc<dyn ForwarderFactory>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<Self> {
        let registry = Arc::new(
            BackendRegistry::new(config.table_capacity, forwarders)
                .context("failed to create backend table")?,
        );

        let manager = RegistrationManager::bind(config.manager_config(), Arc::clone(&registry))
            .await
            .with_context(|| format!("failed to bind control listener on {}", config.control_addr))?;
        let control_addr = manager.local_addr()?;
        let manager_stats = manager.stats();

        let (pipeline, sender) =
            PacketPipeline::start(config.pipeline_config(), Arc::clone(&registry));

        let (control_shutdown, control_rx) = watch::channel(false);
        let manager = tokio::spawn(manager.run(control_rx));

        let (intercept_shutdown, intercept_rx) = watch::channel(false);
        let interception = tokio::spawn({
            let interceptor = Arc::clone(&interceptor);
            let sink = sender.clone();
            async move { interceptor.run(sink, intercept_rx).await }
        });

        if let Some(vip) = config.vip {
            info!(vip = %vip, "Serving VIP");
        }
        info!(
            control_addr = %control_addr,
            table_capacity = config.table_capacity,
            "Balancer started"
        );

        Ok(Self {
            registry,
            control_addr,
            manager,
            manager_stats,
            control_shutdown,
            pipeline,
            sender,
            interceptor,
            interception,
            intercept_shutdown,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Bound control listener address.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Handle for submitting packets directly, bypassing the interceptor.
    pub fn packet_sender(&self) -> PacketSender {
        self.sender.clone()
    }

    pub fn pipeline_stats(&self) -> Arc<PipelineStats> {
        self.pipeline.stats()
    }

    pub fn manager_stats(&self) -> Arc<ManagerStats> {
        Arc::clone(&self.manager_stats)
    }

    /// Run the ordered shutdown sequence.
    pub async fn shutdown(self) {
        let Self {
            registry,
            mut manager,
            control_shutdown,
            pipeline,
            sender,
            interceptor,
            mut interception,
            intercept_shutdown,
            shutdown_grace,
            ..
        } = self;

        info!("Shutting down balancer");

        // sessions get their own grace period inside the manager
        let _ = control_shutdown.send(true);
        match timeout(shutdown_grace * 2, &mut manager).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Registration manager error"),
            Ok(Err(e)) => error!(error = %e, "Registration manager task failed"),
            Err(_) => {
                warn!("Registration manager did not stop in time");
                manager.abort();
            }
        }

        match timeout(shutdown_grace, registry.close_all()).await {
            Ok(0) => {}
            Ok(leftover) => warn!(backends = leftover, "Closed leftover backends"),
            Err(_) => warn!("Closing leftover backends timed out"),
        }

        let _ = intercept_shutdown.send(true);
        match timeout(shutdown_grace, &mut interception).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Interceptor error"),
            Ok(Err(e)) => error!(error = %e, "Interceptor task failed"),
            Err(_) => {
                warn!("Interceptor did not stop in time");
                interception.abort();
            }
        }

        drop(sender);
        pipeline.shutdown(shutdown_grace).await;

        match timeout(shutdown_grace, interceptor.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to release interceptor"),
            Err(_) => warn!("Interceptor release timed out"),
        }

        info!("Balancer stopped");
    }
}
