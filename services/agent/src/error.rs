//! Agent error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentState;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Data listener could not be bound.
    #[error("failed to bind data listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Balancer control listener unreachable.
    #[error("failed to connect to balancer at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Balancer answered `INVALID`.
    #[error("balancer rejected request: {0}")]
    Rejected(String),

    /// No sanity probe arrived on the data path.
    #[error("no sanity probe within {0:?}")]
    SanityTimeout(Duration),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Operation not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },

    /// Control connection is gone.
    #[error("control connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
