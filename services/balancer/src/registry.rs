//! Backend registry.
//!
//! Owns the consistent hash table together with the name -> backend map.
//! Both live in one immutable snapshot behind an [`ArcSwap`]:
//!
//! - Readers (the per-packet lookup path) load the current snapshot without
//!   taking a lock and always see a table and map that agree.
//! - Writers serialize on an async mutex, build the next snapshot off to the
//!   side and publish it with a single pointer swap.
//!
//! Opening and closing forwarders happens outside the writer lock; the
//! critical section is the O(capacity) table rebuild only.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fluxlb_maglev::ConsistentHashTable;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::forwarder::{Forwarder, ForwarderFactory};

/// A registered backend.
pub struct Backend {
    name: String,
    address: IpAddr,
    forwarder: Arc<dyn Forwarder>,
}

impl Backend {
    pub fn new(name: String, address: IpAddr, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            name,
            address,
            forwarder,
        }
    }

    /// Sanitized backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data-plane address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Outbound data channel.
    pub fn forwarder(&self) -> &Arc<dyn Forwarder> {
        &self.forwarder
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Immutable registry state.
#[derive(Clone)]
struct RegistrySnapshot {
    table: ConsistentHashTable,
    backends: HashMap<String, Arc<Backend>>,
}

impl RegistrySnapshot {
    fn empty(table: ConsistentHashTable) -> Self {
        Self {
            table,
            backends: HashMap::new(),
        }
    }

    /// Fail fast if `name` cannot be inserted.
    fn check_insertable(&self, name: &str) -> Result<(), RegistryError> {
        if self.backends.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        if self.table.len() >= self.table.capacity() {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.table.capacity(),
            });
        }
        Ok(())
    }

    /// Create a new snapshot with a backend added.
    fn with_backend(&self, backend: Arc<Backend>) -> Result<Self, RegistryError> {
        let mut table = self.table.clone();
        table.add(backend.name())?;

        let mut backends = self.backends.clone();
        backends.insert(backend.name().to_string(), backend);

        Ok(Self { table, backends })
    }

    /// Create a new snapshot with a backend removed.
    fn without(&self, name: &str) -> Result<(Self, Arc<Backend>), RegistryError> {
        let mut backends = self.backends.clone();
        let backend = backends
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let mut table = self.table.clone();
        table.remove(name)?;

        Ok((Self { table, backends }, backend))
    }
}

/// Registry of live backends, shared by sessions and pipeline workers.
pub struct BackendRegistry {
    /// Atomically swappable table + map snapshot.
    snapshot: ArcSwap<RegistrySnapshot>,
    /// Serializes writers.
    writer: Mutex<()>,
    /// Opens data paths for new backends.
    forwarders: Arc<dyn ForwarderFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("capacity", &self.capacity())
            .field("backends", &self.len())
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// Create an empty registry with a table of `capacity` slots.
    ///
    /// Fails with [`RegistryError::Config`] if `capacity` is not prime.
    pub fn new(
        capacity: usize,
        forwarders: Arc<dyn ForwarderFactory>,
    ) -> Result<Self, RegistryError> {
        let table = ConsistentHashTable::new(capacity).map_err(RegistryError::Config)?;

        Ok(Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::empty(table)),
            writer: Mutex::new(()),
            forwarders,
        })
    }

    /// Table capacity (maximum number of backends).
    pub fn capacity(&self) -> usize {
        self.snapshot.load().table.capacity()
    }

    /// Register a backend and open its data path.
    pub async fn add(&self, name: &str, address: IpAddr) -> Result<Arc<Backend>, RegistryError> {
        self.snapshot.load().check_insertable(name)?;

        let forwarder = self
            .forwarders
            .connect(address)
            .await
            .map_err(|source| RegistryError::Forwarder { address, source })?;

        let backend = Arc::new(Backend::new(
            name.to_string(),
            address,
            Arc::clone(&forwarder),
        ));

        let published = {
            let _guard = self.writer.lock().await;
            let current = self.snapshot.load_full();
            current
                .with_backend(Arc::clone(&backend))
                .map(|next| self.snapshot.store(Arc::new(next)))
        };

        match published {
            Ok(()) => {
                info!(backend = %name, address = %address, "Backend added to table");
                Ok(backend)
            }
            Err(e) => {
                // lost a race with a concurrent add of the same name
                if let Err(close_err) = forwarder.close().await {
                    debug!(backend = %name, error = %close_err, "Failed to close unused forwarder");
                }
                Err(e)
            }
        }
    }

    /// Unregister a backend and close its data path.
    pub async fn remove(&self, name: &str) -> Result<Arc<Backend>, RegistryError> {
        let backend = {
            let _guard = self.writer.lock().await;
            let current = self.snapshot.load_full();
            let (next, backend) = current.without(name)?;
            self.snapshot.store(Arc::new(next));
            backend
        };

        if let Err(e) = backend.forwarder().close().await {
            warn!(backend = %name, error = %e, "Failed to close forwarder");
        }

        info!(backend = %name, "Backend removed from table");
        Ok(backend)
    }

    /// Resolve a flow key to its backend.
    pub fn get(&self, key: &str) -> Result<Arc<Backend>, RegistryError> {
        let snapshot = self.snapshot.load();
        let name = snapshot
            .table
            .get(key)
            .map_err(|_| RegistryError::LookupEmpty)?;

        snapshot
            .backends
            .get(name)
            .cloned()
            .ok_or(RegistryError::LookupEmpty)
    }

    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.snapshot.load().backends.get(name).cloned()
    }

    /// Check if a backend is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot.load().backends.contains_key(name)
    }

    /// All registered backends, sorted by name.
    pub fn list(&self) -> Vec<Arc<Backend>> {
        let snapshot = self.snapshot.load();
        let mut backends: Vec<_> = snapshot.backends.values().cloned().collect();
        backends.sort_by(|a, b| a.name().cmp(b.name()));
        backends
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.snapshot.load().backends.len()
    }

    /// Check if no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().backends.is_empty()
    }

    /// Table slots currently owned by `name`.
    pub fn slots_of(&self, name: &str) -> Vec<usize> {
        self.snapshot.load().table.slots_of(name)
    }

    /// Remove every backend and close its forwarder.
    ///
    /// Returns the number of backends removed.
    pub async fn close_all(&self) -> usize {
        let removed: Vec<Arc<Backend>> = {
            let _guard = self.writer.lock().await;
            let current = self.snapshot.load_full();

            let mut table = current.table.clone();
            table.clear();
            self.snapshot.store(Arc::new(RegistrySnapshot::empty(table)));

            current.backends.values().cloned().collect()
        };

        for backend in &removed {
            if let Err(e) = backend.forwarder().close().await {
                warn!(backend = %backend.name(), error = %e, "Failed to close forwarder");
            }
        }

        removed.len()
    }
}
