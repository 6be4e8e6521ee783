//! Balancer configuration (env-driven).

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fluxlb_maglev::is_prime;
use fluxlb_proto::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};

use crate::manager::{ManagerConfig, DEFAULT_MAX_SESSIONS, DEFAULT_SHUTDOWN_GRACE};
use crate::pipeline::{PipelineConfig, DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};
use crate::session::{SessionConfig, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};

/// Default backend table size.
pub const DEFAULT_TABLE_CAPACITY: usize = 251;

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control listener address.
    pub control_addr: SocketAddr,

    /// UDP port backends receive forwarded packets on.
    pub data_port: u16,

    /// Backend table size. Must be prime.
    pub table_capacity: usize,

    /// Control read timeout; a backend silent for this long is dropped.
    pub read_timeout: Duration,

    /// Control write timeout.
    pub write_timeout: Duration,

    /// Pipeline worker count.
    pub workers: usize,

    /// Pipeline queue depth.
    pub queue_depth: usize,

    /// Maximum concurrent control sessions.
    pub max_sessions: usize,

    /// Time allowed for each shutdown step.
    pub shutdown_grace: Duration,

    /// Virtual IP served by this node. Informational; attachment is external.
    pub vip: Option<IpAddr>,

    /// Bind address of the UDP packet tap, if any.
    pub tap_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)),
            data_port: DEFAULT_DATA_PORT,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_sessions: DEFAULT_MAX_SESSIONS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            vip: None,
            tap_addr: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let control_addr = parse_var(&lookup, "FLUXLB_CONTROL_ADDR")
            .context("FLUXLB_CONTROL_ADDR must be a socket address (ip:port).")?
            .unwrap_or(defaults.control_addr);

        let data_port = parse_var(&lookup, "FLUXLB_DATA_PORT")
            .context("FLUXLB_DATA_PORT must be a port number.")?
            .unwrap_or(defaults.data_port);

        let table_capacity: usize = parse_var(&lookup, "FLUXLB_TABLE_CAPACITY")
            .context("FLUXLB_TABLE_CAPACITY must be an integer.")?
            .unwrap_or(defaults.table_capacity);
        if !is_prime(table_capacity) {
            bail!("FLUXLB_TABLE_CAPACITY must be prime, got {}", table_capacity);
        }

        let read_timeout = parse_var(&lookup, "FLUXLB_READ_TIMEOUT_SECS")
            .context("FLUXLB_READ_TIMEOUT_SECS must be an integer (seconds).")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.read_timeout);

        let write_timeout = parse_var(&lookup, "FLUXLB_WRITE_TIMEOUT_SECS")
            .context("FLUXLB_WRITE_TIMEOUT_SECS must be an integer (seconds).")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.write_timeout);

        let workers: usize = parse_var(&lookup, "FLUXLB_WORKERS")
            .context("FLUXLB_WORKERS must be an integer.")?
            .unwrap_or(defaults.workers)
            .max(1);

        let queue_depth: usize = parse_var(&lookup, "FLUXLB_QUEUE_DEPTH")
            .context("FLUXLB_QUEUE_DEPTH must be an integer.")?
            .unwrap_or(defaults.queue_depth)
            .max(1);

        let max_sessions: usize = parse_var(&lookup, "FLUXLB_MAX_SESSIONS")
            .context("FLUXLB_MAX_SESSIONS must be an integer.")?
            .unwrap_or(defaults.max_sessions)
            .max(1);

        let shutdown_grace = parse_var(&lookup, "FLUXLB_SHUTDOWN_GRACE_MS")
            .context("FLUXLB_SHUTDOWN_GRACE_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace);

        let vip = parse_var(&lookup, "FLUXLB_VIP").context("FLUXLB_VIP must be an IP address.")?;

        let tap_addr = parse_var(&lookup, "FLUXLB_TAP_ADDR")
            .context("FLUXLB_TAP_ADDR must be a socket address (ip:port).")?;

        let log_level = lookup("FLUXLB_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            control_addr,
            data_port,
            table_capacity,
            read_timeout,
            write_timeout,
            workers,
            queue_depth,
            max_sessions,
            shutdown_grace,
            vip,
            tap_addr,
            log_level,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            bind_addr: self.control_addr,
            max_sessions: self.max_sessions,
            session: self.session_config(),
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.workers,
            queue_depth: self.queue_depth,
        }
    }
}

/// Parse an optional variable; empty values count as unset.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.control_addr, "0.0.0.0:1338".parse().unwrap());
        assert_eq!(config.data_port, 1337);
        assert_eq!(config.table_capacity, 251);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.workers, 20);
        assert_eq!(config.queue_depth, 100);
        assert!(config.vip.is_none());
        assert!(config.tap_addr.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FLUXLB_CONTROL_ADDR", "127.0.0.1:9000"),
            ("FLUXLB_TABLE_CAPACITY", "53"),
            ("FLUXLB_READ_TIMEOUT_SECS", "5"),
            ("FLUXLB_WORKERS", "0"),
            ("FLUXLB_VIP", "203.0.113.10"),
            ("FLUXLB_TAP_ADDR", "127.0.0.1:7000"),
            ("FLUXLB_SHUTDOWN_GRACE_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.control_addr.port(), 9000);
        assert_eq!(config.table_capacity, 53);
        assert_eq!(config.manager_config().session.read_timeout, Duration::from_secs(5));
        assert_eq!(config.pipeline_config().workers, 1);
        assert_eq!(config.vip, Some("203.0.113.10".parse().unwrap()));
        assert_eq!(config.tap_addr, Some("127.0.0.1:7000".parse().unwrap()));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_non_prime_capacity() {
        let err = load(&[("FLUXLB_TABLE_CAPACITY", "100")]).unwrap_err();
        assert!(err.to_string().contains("prime"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(load(&[("FLUXLB_DATA_PORT", "seventy")]).is_err());
        assert!(load(&[("FLUXLB_CONTROL_ADDR", "localhost")]).is_err());
        assert!(load(&[("FLUXLB_VIP", "10.0.0")]).is_err());
    }
}
