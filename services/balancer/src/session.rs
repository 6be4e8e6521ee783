//! Per-backend registration session.
//!
//! One session runs for every accepted control connection and owns that
//! backend's lifecycle:
//!
//! ```text
//! Registering -> SanityChecking -> Active <-> Paused -> Deregistering -> Closed
//!       |               |
//!       +---------------+--> Closed (rejected)
//! ```
//!
//! The backend enters the registry as soon as `REGISTER` is accepted so the
//! sanity probe can travel over its real forwarder. A failed handshake takes
//! it out again before the connection is closed.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use fluxlb_proto::{
    encode_sanity_probe, generate_nonce, ProtoError, Reply, Request, HEALTH_OK,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn, Span};

use crate::channel::{ChannelError, ControlChannel};
use crate::error::{RegistryError, SessionError};
use crate::registry::BackendRegistry;

/// Default control read timeout; also the health-check deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default control write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registering,
    SanityChecking,
    Active,
    Paused,
    Deregistering,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Registering, SanityChecking)
                | (Registering, Closed)
                | (SanityChecking, Active)
                | (SanityChecking, Closed)
                | (Active, Paused)
                | (Active, Deregistering)
                | (Paused, Active)
                | (Paused, Deregistering)
                | (Deregistering, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registering => "registering",
            Self::SanityChecking => "sanity_checking",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deregistering => "deregistering",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Session timeouts.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Maximum silence on the control channel.
    pub read_timeout: Duration,
    /// Maximum time to write one reply.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Why an established backend left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeregisterReason {
    ClientRequested,
    HealthTimeout,
    PeerClosed,
    Transport(String),
    Shutdown,
}

impl fmt::Display for DeregisterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientRequested => f.write_str("client requested deregistration"),
            Self::HealthTimeout => f.write_str("health check timeout ran out"),
            Self::PeerClosed => f.write_str("control connection closed by peer"),
            Self::Transport(e) => write!(f, "error reading from control connection: {}", e),
            Self::Shutdown => f.write_str("balancer shutting down"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Handshake failed; carries the reason sent in `INVALID`.
    Rejected(String),
    /// Backend was registered and has now left.
    Deregistered {
        name: String,
        reason: DeregisterReason,
    },
}

/// Control-channel state machine for one backend.
pub struct RegistrationSession<S> {
    channel: ControlChannel<S>,
    registry: Arc<BackendRegistry>,
    state: SessionState,
    name: Option<String>,
    data_address: Option<IpAddr>,
}

impl<S> RegistrationSession<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, registry: Arc<BackendRegistry>, config: SessionConfig) -> Self {
        Self {
            channel: ControlChannel::new(stream, config.read_timeout, config.write_timeout),
            registry,
            state: SessionState::Registering,
            name: None,
            data_address: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Backend name, once `REGISTER` has been accepted.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data_address(&self) -> Option<IpAddr> {
        self.data_address
    }

    /// Drive the session to completion.
    ///
    /// `shutdown` flipping to `true` (or its sender going away) ends the
    /// session through the regular deregistration path.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionOutcome {
        let handshake = tokio::select! {
            result = self.handshake() => result,
            _ = shutdown_signalled(&mut shutdown) => Err(SessionError::Shutdown),
        };

        if let Err(err) = handshake {
            return self.reject(err).await;
        }

        let reason = self.monitor(&mut shutdown).await;
        self.deregister(reason).await
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let (name, address) = self.register().await?;
        self.sanity_check().await?;

        self.channel
            .send(&Reply::Registered {
                name: name.clone(),
                address,
            })
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        self.activate();
        info!(backend = %name, address = %address, "Backend registered");
        Ok(())
    }

    /// Read `REGISTER` and insert the backend into the registry.
    async fn register(&mut self) -> Result<(String, IpAddr), SessionError> {
        let line = self
            .channel
            .read_line()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (name, address) = match Request::decode(&line) {
            Ok(Request::Register { name, address }) => (name, address),
            Ok(_) => return Err(SessionError::Protocol(not_an_option(&line))),
            Err(ProtoError::InvalidAddress(_)) => {
                return Err(SessionError::Protocol("ip not parseable".to_string()))
            }
            Err(ProtoError::Malformed { reason, .. }) => return Err(SessionError::Protocol(reason)),
            Err(e) => return Err(SessionError::Protocol(e.to_string())),
        };

        Span::current().record("backend", name.as_str());

        self.registry.add(&name, address).await?;
        self.name = Some(name.clone());
        self.data_address = Some(address);
        self.begin_sanity_check();

        Ok((name, address))
    }

    /// Probe the data path and wait for the nonce to come back.
    async fn sanity_check(&mut self) -> Result<(), SessionError> {
        let backend = self
            .name
            .as_deref()
            .and_then(|name| self.registry.backend(name))
            .ok_or_else(|| SessionError::SanityCheckFailed("backend vanished".to_string()))?;

        let nonce = generate_nonce();
        backend
            .forwarder()
            .send_data(&encode_sanity_probe(&nonce))
            .await
            .map_err(|e| SessionError::SanityCheckFailed(format!("data path unreachable: {}", e)))?;

        trace!(backend = %backend.name(), "Sanity probe sent");

        let line = self
            .channel
            .read_line()
            .await
            .map_err(|e| SessionError::SanityCheckFailed(e.to_string()))?;

        match Request::decode(&line) {
            Ok(Request::Sane { nonce: echoed }) if echoed == nonce => Ok(()),
            Ok(Request::Sane { .. }) => Err(SessionError::SanityCheckFailed(
                "nonce mismatch".to_string(),
            )),
            _ => Err(SessionError::SanityCheckFailed(format!(
                "expected SANE, got {:?}",
                line
            ))),
        }
    }

    /// Serve requests until the backend leaves.
    async fn monitor(&mut self, shutdown: &mut watch::Receiver<bool>) -> DeregisterReason {
        loop {
            let read = tokio::select! {
                _ = shutdown_signalled(shutdown) => return DeregisterReason::Shutdown,
                read = self.channel.read_line() => read,
            };

            let line = match read {
                Ok(line) => line,
                Err(ChannelError::InvalidUtf8(lossy)) => {
                    let reply = Reply::Invalid(not_an_option(&lossy));
                    if let Err(e) = self.channel.send(&reply).await {
                        return DeregisterReason::Transport(e.to_string());
                    }
                    continue;
                }
                Err(ChannelError::ReadTimeout(_)) => return DeregisterReason::HealthTimeout,
                Err(ChannelError::Closed) => return DeregisterReason::PeerClosed,
                Err(e) => return DeregisterReason::Transport(e.to_string()),
            };

            let reply = match Request::decode(&line) {
                Ok(Request::Health { code }) => {
                    trace!(code = %code, "Health check");
                    Reply::HealthAck(HEALTH_OK)
                }
                Ok(Request::Pause) => self.pause().await,
                Ok(Request::Resume) => self.resume().await,
                Ok(Request::Deregister) => return DeregisterReason::ClientRequested,
                Ok(Request::Register { .. } | Request::Sane { .. } | Request::Unknown(_)) => {
                    Reply::Invalid(not_an_option(&line))
                }
                Err(ProtoError::Empty) => Reply::Invalid("empty message".to_string()),
                Err(ProtoError::Malformed {
                    command: "HEALTH",
                    reason,
                }) => Reply::Invalid(reason),
                Err(_) => Reply::Invalid(not_an_option(&line)),
            };

            if let Err(e) = self.channel.send(&reply).await {
                return DeregisterReason::Transport(e.to_string());
            }
        }
    }

    /// Take the backend out of the table; the session stays open.
    async fn pause(&mut self) -> Reply {
        if self.state == SessionState::Paused {
            return Reply::Invalid("backend already paused".to_string());
        }
        let Some(name) = self.name.clone() else {
            return Reply::Invalid("backend not registered".to_string());
        };

        match self.registry.remove(&name).await {
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => {
                debug!(backend = %name, "Backend already absent from table");
                return Reply::Invalid("backend already paused".to_string());
            }
            Err(e) => return Reply::Invalid(e.to_string()),
        }

        self.pause_backend();
        info!(backend = %name, "Backend paused");
        Reply::Paused(name)
    }

    /// Put a paused backend back into the table.
    async fn resume(&mut self) -> Reply {
        if self.state == SessionState::Active {
            return Reply::Invalid("backend already active".to_string());
        }
        let (Some(name), Some(address)) = (self.name.clone(), self.data_address) else {
            return Reply::Invalid("backend not registered".to_string());
        };

        match self.registry.add(&name, address).await {
            Ok(_) => {
                self.activate();
                info!(backend = %name, "Backend resumed");
                Reply::Resumed(name)
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "Resume failed");
                Reply::Invalid(format!("registration failed: {}", e))
            }
        }
    }

    /// Remove the backend, notify the peer and close.
    async fn deregister(mut self, reason: DeregisterReason) -> SessionOutcome {
        let was_active = self.state == SessionState::Active;
        self.begin_deregistration();

        let name = self.name.clone().unwrap_or_default();

        // a paused backend no longer owns the name in the registry
        if was_active {
            match self.registry.remove(&name).await {
                Ok(_) | Err(RegistryError::NotFound(_)) => {}
                Err(e) => warn!(backend = %name, error = %e, "Failed to remove backend"),
            }
        }

        let notice = Reply::Deregistered {
            name: name.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.channel.send(&notice).await {
            debug!(backend = %name, error = %e, "Failed to send deregistration notice");
        }

        self.close().await;
        info!(backend = %name, reason = %reason, "Backend deregistered");

        SessionOutcome::Deregistered { name, reason }
    }

    /// Undo a partial registration and reply `INVALID`.
    async fn reject(mut self, err: SessionError) -> SessionOutcome {
        let reason = rejection_reason(&err);
        warn!(error = %err, "Registration rejected");

        if self.state == SessionState::SanityChecking {
            if let Some(name) = self.name.as_deref() {
                match self.registry.remove(name).await {
                    Ok(_) | Err(RegistryError::NotFound(_)) => {}
                    Err(e) => warn!(backend = %name, error = %e, "Failed to roll back registration"),
                }
            }
        }

        if let Err(e) = self.channel.send(&Reply::Invalid(reason.clone())).await {
            debug!(error = %e, "Failed to send rejection");
        }

        self.close().await;
        SessionOutcome::Rejected(reason)
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.shutdown().await {
            debug!(error = %e, "Control channel shutdown failed");
        }
        self.transition(SessionState::Closed);
    }

    fn begin_sanity_check(&mut self) {
        self.transition(SessionState::SanityChecking);
    }

    fn activate(&mut self) {
        self.transition(SessionState::Active);
    }

    fn pause_backend(&mut self) {
        self.transition(SessionState::Paused);
    }

    fn begin_deregistration(&mut self) {
        self.transition(SessionState::Deregistering);
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {} -> {}",
            self.state,
            next
        );
        trace!(from = %self.state, to = %next, "Session state change");
        self.state = next;
    }
}

/// Resolve once shutdown is requested. A dropped sender counts as a request.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn not_an_option(line: &str) -> String {
    let token = line.split_whitespace().next().unwrap_or_default();
    format!("first token of message ({}) is not an option", token)
}

/// Text sent after `INVALID` when a handshake fails.
fn rejection_reason(err: &SessionError) -> String {
    match err {
        SessionError::Protocol(reason) | SessionError::Transport(reason) => reason.clone(),
        SessionError::Rejected(e) => format!("registration failed: {}", e),
        SessionError::SanityCheckFailed(reason) => format!("bad sanity check: {}", reason),
        SessionError::Shutdown => "balancer shutting down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{ChannelForwarderFactory, Delivery};
    use fluxlb_proto::parse_sanity_probe;
    use fluxlb_testing::LineClient;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Fixture {
        registry: Arc<BackendRegistry>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        client: LineClient<DuplexStream>,
        shutdown: watch::Sender<bool>,
        session: JoinHandle<SessionOutcome>,
    }

    impl Fixture {
        fn start(capacity: usize, config: SessionConfig) -> Self {
            let (factory, deliveries) = ChannelForwarderFactory::new();
            let registry = Arc::new(BackendRegistry::new(capacity, Arc::new(factory)).unwrap());
            Self::with_registry(registry, deliveries, config)
        }

        fn with_registry(
            registry: Arc<BackendRegistry>,
            deliveries: mpsc::UnboundedReceiver<Delivery>,
            config: SessionConfig,
        ) -> Self {
            let (client, server) = tokio::io::duplex(4096);
            let (shutdown, shutdown_rx) = watch::channel(false);
            let session = RegistrationSession::new(server, Arc::clone(&registry), config);

            Self {
                registry,
                deliveries,
                client: LineClient::new(client),
                shutdown,
                session: tokio::spawn(session.run(shutdown_rx)),
            }
        }

        async fn probe_nonce(&mut self) -> String {
            let delivery = tokio::time::timeout(Duration::from_secs(5), self.deliveries.recv())
                .await
                .unwrap()
                .unwrap();
            parse_sanity_probe(&delivery.payload).unwrap().to_string()
        }

        async fn register(&mut self, name: &str, address: &str) {
            self.client
                .send(&format!("REGISTER {} {}", name, address))
                .await
                .unwrap();
            let nonce = self.probe_nonce().await;
            self.client.send(&format!("SANE {}", nonce)).await.unwrap();
            assert_eq!(
                self.client.recv().await.unwrap(),
                format!("REGISTERED {} {}", name, address)
            );
        }

        async fn request(&mut self, line: &str) -> String {
            self.client.send(line).await.unwrap();
            self.client.recv().await.unwrap()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Registering.can_transition_to(SanityChecking));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Registering.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Registering));
        assert!(!Paused.can_transition_to(Paused));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;

        assert_eq!(fx.registry.get("192.0.2.9:40000").unwrap().name(), "b1");
        assert_eq!(fx.request("HEALTH 200").await, "HEALTHACK 200");
        assert_eq!(
            fx.request("DEREGISTER").await,
            "DEREGISTERED b1 client requested deregistration"
        );
        fx.client.expect_closed().await.unwrap();

        assert_eq!(
            fx.session.await.unwrap(),
            SessionOutcome::Deregistered {
                name: "b1".to_string(),
                reason: DeregisterReason::ClientRequested,
            }
        );
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_nonce_rejected() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.client.send("REGISTER b1 10.0.0.2").await.unwrap();
        let _ = fx.probe_nonce().await;

        let reply = fx.request("SANE NOTTHENONCE").await;
        assert_eq!(reply, "INVALID bad sanity check: nonce mismatch");
        fx.client.expect_closed().await.unwrap();

        assert!(matches!(
            fx.session.await.unwrap(),
            SessionOutcome::Rejected(_)
        ));
        assert!(!fx.registry.contains("b1"));
    }

    #[tokio::test]
    async fn test_pause_resume_restores_slots() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.registry.add("b2", ip("10.0.0.3")).await.unwrap();
        fx.register("b1", "10.0.0.2").await;

        let slots = fx.registry.slots_of("b1");
        assert!(!slots.is_empty());

        assert_eq!(fx.request("PAUSE").await, "PAUSED b1");
        assert!(!fx.registry.contains("b1"));
        assert!(fx.registry.slots_of("b1").is_empty());
        assert_eq!(fx.request("PAUSE").await, "INVALID backend already paused");

        assert_eq!(fx.request("RESUME").await, "RESUMED b1");
        assert_eq!(fx.registry.slots_of("b1"), slots);
        assert_eq!(fx.request("RESUME").await, "INVALID backend already active");
    }

    #[tokio::test]
    async fn test_health_timeout_deregisters() {
        let config = SessionConfig {
            read_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_secs(1),
        };
        let mut fx = Fixture::start(53, config);
        fx.register("b1", "10.0.0.2").await;

        assert_eq!(
            fx.client.recv().await.unwrap(),
            "DEREGISTERED b1 health check timeout ran out"
        );
        fx.client.expect_closed().await.unwrap();
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let mut fx = Fixture::start(3, SessionConfig::default());
        for name in ["a", "b", "c"] {
            fx.registry.add(name, ip("10.0.0.9")).await.unwrap();
        }
        let before = fx.registry.slots_of("a");

        let reply = fx.request("REGISTER d 10.0.0.2").await;
        assert_eq!(
            reply,
            "INVALID registration failed: backend table is full (3 backends)"
        );
        fx.client.expect_closed().await.unwrap();

        assert_eq!(fx.registry.len(), 3);
        assert_eq!(fx.registry.slots_of("a"), before);
    }

    #[tokio::test]
    async fn test_duplicate_name_keeps_existing_backend() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.registry.add("b1", ip("10.0.0.9")).await.unwrap();

        let reply = fx.request("REGISTER b1 10.0.0.2").await;
        assert_eq!(
            reply,
            "INVALID registration failed: backend b1 is already registered"
        );
        assert_eq!(fx.registry.backend("b1").unwrap().address(), ip("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_bad_registration_lines() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        assert_eq!(
            fx.request("REGISTER b1 10.0.0.300").await,
            "INVALID ip not parseable"
        );
        fx.client.expect_closed().await.unwrap();

        let mut fx = Fixture::start(53, SessionConfig::default());
        assert_eq!(
            fx.request("HEALTH 200").await,
            "INVALID first token of message (HEALTH) is not an option"
        );
    }

    #[tokio::test]
    async fn test_invalid_requests_keep_session() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;

        assert_eq!(
            fx.request("JUMP high").await,
            "INVALID first token of message (JUMP) is not an option"
        );
        assert_eq!(fx.request("").await, "INVALID empty message");
        assert_eq!(
            fx.request("HEALTH").await,
            "INVALID no status code in health check"
        );
        assert_eq!(
            fx.request("REGISTER b9 10.0.0.9").await,
            "INVALID first token of message (REGISTER) is not an option"
        );
        assert!(fx.registry.contains("b1"));
        assert!(!fx.registry.contains("b9"));
    }

    #[tokio::test]
    async fn test_non_utf8_line_keeps_session() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;

        fx.client.send_bytes(b"\xff\xfe GARBAGE\n").await.unwrap();
        let reply = fx.client.recv().await.unwrap();
        assert!(
            reply.starts_with("INVALID first token of message ("),
            "{}",
            reply
        );
        assert!(reply.ends_with(") is not an option"), "{}", reply);

        assert!(fx.registry.contains("b1"));
        assert_eq!(fx.request("HEALTH 200").await, "HEALTHACK 200");
    }

    #[tokio::test]
    async fn test_pause_of_absent_backend_is_invalid() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;

        // removed behind the session's back
        fx.registry.remove("b1").await.unwrap();

        assert_eq!(fx.request("PAUSE").await, "INVALID backend already paused");
        // still active, so RESUME is refused as well
        assert_eq!(fx.request("RESUME").await, "INVALID backend already active");
        assert_eq!(
            fx.request("DEREGISTER").await,
            "DEREGISTERED b1 client requested deregistration"
        );
        assert_eq!(
            fx.session.await.unwrap(),
            SessionOutcome::Deregistered {
                name: "b1".to_string(),
                reason: DeregisterReason::ClientRequested,
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_sends_deregistered() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;

        fx.shutdown.send(true).unwrap();
        assert_eq!(
            fx.client.recv().await.unwrap(),
            "DEREGISTERED b1 balancer shutting down"
        );
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_deregisters() {
        let mut fx = Fixture::start(53, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;
        drop(fx.client);

        assert_eq!(
            fx.session.await.unwrap(),
            SessionOutcome::Deregistered {
                name: "b1".to_string(),
                reason: DeregisterReason::PeerClosed,
            }
        );
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_paused_backend_name_not_removed_on_exit() {
        let (factory, deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());
        let mut fx =
            Fixture::with_registry(Arc::clone(&registry), deliveries, SessionConfig::default());
        fx.register("b1", "10.0.0.2").await;
        assert_eq!(fx.request("PAUSE").await, "PAUSED b1");

        // another backend takes the freed name
        registry.add("b1", ip("10.0.0.7")).await.unwrap();

        assert_eq!(
            fx.request("DEREGISTER").await,
            "DEREGISTERED b1 client requested deregistration"
        );
        fx.session.await.unwrap();
        assert_eq!(registry.backend("b1").unwrap().address(), ip("10.0.0.7"));
    }
}
