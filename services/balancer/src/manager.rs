//! Control listener and session supervision.
//!
//! The manager accepts control connections and runs one
//! [`RegistrationSession`] per connection. Sessions are the only code that
//! adds backends to or removes them from the registry.
//!
//! ## Shutdown
//!
//! 1. The listener is dropped, so new connections are refused.
//! 2. Every session is told to stop and sends `DEREGISTERED` on its way out.
//! 3. Sessions still running after the grace period are aborted.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::BackendRegistry;
use crate::session::{shutdown_signalled, RegistrationSession, SessionConfig, SessionOutcome};

/// Default maximum concurrent control sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Default time sessions get to deregister on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the registration manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Control listener address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Per-session timeouts.
    pub session: SessionConfig,
    /// How long sessions may take to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl ManagerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session: SessionConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Control-plane counters.
#[derive(Debug, Default)]
pub struct ManagerStats {
    /// Connections accepted.
    pub sessions_accepted: AtomicU64,
    /// Sessions currently running.
    pub sessions_active: AtomicU64,
    /// Connections refused because the session limit was reached.
    pub sessions_rejected: AtomicU64,
    /// Handshakes that ended in `INVALID`.
    pub registrations_failed: AtomicU64,
    /// Registered backends that have since deregistered.
    pub deregistrations: AtomicU64,
}

/// Accepts control connections and supervises their sessions.
pub struct RegistrationManager {
    config: ManagerConfig,
    listener: TcpListener,
    registry: Arc<BackendRegistry>,
    session_slots: Arc<Semaphore>,
    stats: Arc<ManagerStats>,
}

impl RegistrationManager {
    /// Bind the control listener.
    pub async fn bind(config: ManagerConfig, registry: Arc<BackendRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_sessions = config.max_sessions,
            "Control listener bound"
        );

        Ok(Self {
            session_slots: Arc::new(Semaphore::new(config.max_sessions)),
            listener,
            config,
            registry,
            stats: Arc::new(ManagerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ManagerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` is signalled, then wind down
    /// every session.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let Self {
            config,
            listener,
            registry,
            session_slots,
            stats,
        } = self;

        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Registration manager started");

        let (stop_sessions, sessions_shutdown) = watch::channel(false);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            // Brief sleep to avoid tight loop on persistent errors
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let permit = match Arc::clone(&session_slots).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max sessions reached");
                            continue;
                        }
                    };

                    stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.sessions_active.fetch_add(1, Ordering::Relaxed);

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let session = RegistrationSession::new(stream, Arc::clone(&registry), config.session);
                    let session_shutdown = sessions_shutdown.clone();
                    let stats = Arc::clone(&stats);

                    sessions.spawn(
                        async move {
                            match session.run(session_shutdown).await {
                                SessionOutcome::Rejected(reason) => {
                                    stats.registrations_failed.fetch_add(1, Ordering::Relaxed);
                                    debug!(reason = %reason, "Session ended without registration");
                                }
                                SessionOutcome::Deregistered { .. } => {
                                    stats.deregistrations.fetch_add(1, Ordering::Relaxed);
                                }
                            }

                            stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(info_span!(
                            "session",
                            peer_addr = %peer_addr,
                            backend = tracing::field::Empty
                        )),
                    );
                }
            }
        }

        drop(listener);
        info!(sessions = sessions.len(), "Control listener closed, stopping sessions");

        let _ = stop_sessions.send(true);

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Session task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "Sessions did not finish within grace period, aborting"
            );
            sessions.shutdown().await;
        }

        info!("Registration manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{ChannelForwarderFactory, Delivery};
    use fluxlb_proto::parse_sanity_probe;
    use fluxlb_testing::LineClient;
    use tokio::sync::mpsc;

    async fn start(
        max_sessions: usize,
    ) -> (
        SocketAddr,
        Arc<BackendRegistry>,
        Arc<ManagerStats>,
        mpsc::UnboundedReceiver<Delivery>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let (factory, deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());

        let mut config = ManagerConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_sessions = max_sessions;

        let manager = RegistrationManager::bind(config, Arc::clone(&registry))
            .await
            .unwrap();
        let addr = manager.local_addr().unwrap();
        let stats = manager.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(shutdown_rx));

        (addr, registry, stats, deliveries, shutdown_tx, handle)
    }

    async fn register(
        client: &mut LineClient<tokio::net::TcpStream>,
        deliveries: &mut mpsc::UnboundedReceiver<Delivery>,
        name: &str,
        address: &str,
    ) {
        client
            .send(&format!("REGISTER {} {}", name, address))
            .await
            .unwrap();
        let delivery = deliveries.recv().await.unwrap();
        let nonce = parse_sanity_probe(&delivery.payload).unwrap().to_string();
        client.send(&format!("SANE {}", nonce)).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            format!("REGISTERED {} {}", name, address)
        );
    }

    #[tokio::test]
    async fn test_sessions_deregistered_on_shutdown() {
        let (addr, registry, stats, mut deliveries, shutdown, handle) = start(16).await;

        let mut b1 = LineClient::connect(addr).await.unwrap();
        register(&mut b1, &mut deliveries, "b1", "10.0.0.2").await;
        let mut b2 = LineClient::connect(addr).await.unwrap();
        register(&mut b2, &mut deliveries, "b2", "10.0.0.3").await;
        assert_eq!(registry.len(), 2);

        shutdown.send(true).unwrap();

        assert_eq!(
            b1.recv().await.unwrap(),
            "DEREGISTERED b1 balancer shutting down"
        );
        assert_eq!(
            b2.recv().await.unwrap(),
            "DEREGISTERED b2 balancer shutting down"
        );
        handle.await.unwrap().unwrap();

        assert!(registry.is_empty());
        assert_eq!(stats.sessions_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(stats.deregistrations.load(Ordering::Relaxed), 2);
        assert_eq!(stats.sessions_active.load(Ordering::Relaxed), 0);

        // listener is gone
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (addr, _registry, stats, mut deliveries, shutdown, handle) = start(1).await;

        let mut b1 = LineClient::connect(addr).await.unwrap();
        register(&mut b1, &mut deliveries, "b1", "10.0.0.2").await;

        let mut excess = LineClient::connect(addr).await.unwrap();
        excess.expect_closed().await.unwrap();
        assert_eq!(stats.sessions_rejected.load(Ordering::Relaxed), 1);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_counted() {
        let (addr, registry, stats, _deliveries, shutdown, handle) = start(16).await;

        let mut client = LineClient::connect(addr).await.unwrap();
        client.send("REGISTER b1 not-an-ip").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), "INVALID ip not parseable");
        client.expect_closed().await.unwrap();

        assert!(registry.is_empty());
        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(stats.registrations_failed.load(Ordering::Relaxed), 1);
    }
}
