//! fluxlb backend agent.
//!
//! Runs on each backend host: registers the host with the balancer, proves
//! the data path by echoing the sanity probe, keeps the registration alive
//! with periodic health checks and hands forwarded packets to the
//! application.

pub mod agent;
pub mod config;
pub mod error;

pub use agent::{register, AgentHandle, AgentState};
pub use config::AgentConfig;
pub use error::AgentError;
