//! Agent configuration (env-driven).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use fluxlb_proto::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};

/// Default interval between health checks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(20);

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend name announced in `REGISTER`.
    pub name: String,

    /// Balancer control listener.
    pub balancer_addr: SocketAddr,

    /// IP the balancer forwards packets to.
    pub data_ip: IpAddr,

    /// UDP port packets arrive on. Must match the balancer's data port.
    pub data_port: u16,

    /// Interval between `HEALTH` messages. Keep it below the balancer's
    /// read timeout.
    pub health_interval: Duration,

    /// How long to wait for each registration step.
    pub read_timeout: Duration,

    /// Control write timeout.
    pub write_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, balancer_addr: SocketAddr, data_ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            balancer_addr,
            data_ip,
            data_port: DEFAULT_DATA_PORT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("FLUXLB_AGENT_NAME").context("Missing FLUXLB_AGENT_NAME.")?;

        let balancer_addr: SocketAddr = std::env::var("FLUXLB_BALANCER_ADDR")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLUXLB_BALANCER_ADDR must be a socket address (ip:port).")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONTROL_PORT)));

        let data_ip: IpAddr = std::env::var("FLUXLB_DATA_IP")
            .context("Missing FLUXLB_DATA_IP.")?
            .parse()
            .context("FLUXLB_DATA_IP must be an IP address.")?;

        let mut config = Self::new(name, balancer_addr, data_ip);

        if let Some(port) = std::env::var("FLUXLB_DATA_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLUXLB_DATA_PORT must be a port number.")?
        {
            config.data_port = port;
        }

        if let Some(secs) = env_secs("FLUXLB_HEALTH_INTERVAL_SECS")? {
            config.health_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("FLUXLB_READ_TIMEOUT_SECS")? {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("FLUXLB_WRITE_TIMEOUT_SECS")? {
            config.write_timeout = Duration::from_secs(secs);
        }

        if let Ok(level) = std::env::var("FLUXLB_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Address of the data listener.
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.data_ip, self.data_port)
    }
}

fn env_secs(key: &str) -> Result<Option<u64>> {
    std::env::var(key)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{} must be an integer (seconds).", key))
}
