//! Balancer error types.

use std::io;
use std::net::IpAddr;

use fluxlb_maglev::TableError;
use thiserror::Error;

/// Errors from the backend registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid table configuration (capacity not prime).
    #[error("invalid backend table: {0}")]
    Config(TableError),

    /// No slot left for another backend.
    #[error("backend table is full ({capacity} backends)")]
    CapacityExceeded { capacity: usize },

    /// Name already registered.
    #[error("backend {0} is already registered")]
    AlreadyRegistered(String),

    /// Name not registered.
    #[error("backend {0} is not registered")]
    NotFound(String),

    /// Lookup while no backend is registered.
    #[error("no backends registered")]
    LookupEmpty,

    /// Data path to the backend could not be opened.
    #[error("failed to open data path to {address}: {source}")]
    Forwarder {
        address: IpAddr,
        #[source]
        source: io::Error,
    },
}

impl From<TableError> for RegistryError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Full { capacity } => Self::CapacityExceeded { capacity },
            TableError::Duplicate(name) => Self::AlreadyRegistered(name),
            TableError::NotFound(name) => Self::NotFound(name),
            TableError::Empty => Self::LookupEmpty,
            err @ TableError::NotPrime(_) => Self::Config(err),
        }
    }
}

/// Errors that end a registration session before it becomes active.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or unexpected control message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registry refused the backend.
    #[error("registration rejected: {0}")]
    Rejected(#[from] RegistryError),

    /// Data path probe was not echoed correctly.
    #[error("sanity check failed: {0}")]
    SanityCheckFailed(String),

    /// Control connection read/write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Balancer shutdown interrupted the handshake.
    #[error("balancer shutting down")]
    Shutdown,
}
