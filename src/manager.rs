//! The lock manager
//!
//! Owns one lock map per resource type, the client pool and the statistics
//! shared by all clients. Clients keep the shared state alive, so a client
//! may outlive the `LockManager` handle that created it.

use std::sync::Arc;

use crate::client::Client;
use crate::common::{ClientId, Config, LockError, LockMode, ResourceId, Result};
use crate::lock::Lock;
use crate::lock_map::LockMap;
use crate::pool::{ClientPool, ClientRegistry};
use crate::resource::ResourceType;
use crate::stats::{LockStats, LockStatsSnapshot, SharedLockStats};

/// State shared between a lock manager and its clients
pub(crate) struct ManagerShared {
    pub(crate) config: Config,
    pub(crate) resource_types: Vec<ResourceType>,
    pub(crate) lock_maps: Vec<LockMap>,
    pub(crate) pool: ClientPool,
    pub(crate) stats: SharedLockStats,
}

impl ManagerShared {
    /// The lock map of a registered resource type, with its index
    pub(crate) fn lock_map(&self, resource_type: &ResourceType) -> Result<(usize, &LockMap)> {
        let index = resource_type.id() as usize;
        match self.resource_types.get(index) {
            Some(registered) if registered == resource_type => Ok((index, &self.lock_maps[index])),
            _ => Err(LockError::UnknownResourceType {
                id: resource_type.id(),
                name: resource_type.name().to_string(),
            }),
        }
    }

    pub(crate) fn registry(&self) -> &ClientRegistry {
        self.pool.registry()
    }
}

/// One locked resource, as seen by [`LockManager::accept`]
#[derive(Debug, Clone)]
pub struct LockInfo<'a> {
    pub resource_type: &'a ResourceType,
    pub resource_id: ResourceId,
    pub mode: LockMode,
    /// Number of holders at the time of the visit
    pub holders: u32,
    /// A holder is upgrading this shared lock to exclusive
    pub update_lock: bool,
    /// The upgrading holder, once it has registered itself
    pub update_holder: Option<ClientId>,
    /// Holders and their wait-lists
    pub description: String,
    /// Identity of the lock object; equal for the same lock object across visits
    pub identity: usize,
}

/// In-process lock manager with deadlock detection
pub struct LockManager {
    shared: Arc<ManagerShared>,
}

impl LockManager {
    /// Create a lock manager for the given resource types.
    ///
    /// Resource type ids must be dense, `resource_types[i].id() == i`.
    pub fn new(config: Config, resource_types: Vec<ResourceType>) -> Result<Self> {
        config.validate()?;

        for (index, resource_type) in resource_types.iter().enumerate() {
            if resource_type.id() as usize != index {
                return Err(LockError::InvalidConfig {
                    message: format!(
                        "Resource type {} has id {} but is registered at position {}",
                        resource_type,
                        resource_type.id(),
                        index
                    ),
                });
            }
        }

        let stats: SharedLockStats = Arc::new(LockStats::new());
        let pool = ClientPool::new(
            resource_types.len(),
            config.max_idle_clients,
            config.recycled_client_id_limit,
            Arc::clone(&stats),
        );
        let lock_maps = resource_types.iter().map(|_| LockMap::new()).collect();

        log::info!(
            "Lock manager started with {} resource types, deadlock resolution {}",
            resource_types.len(),
            config.deadlock_resolution.as_str()
        );

        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                resource_types,
                lock_maps,
                pool,
                stats,
            }),
        })
    }

    /// Hand out a client for one transaction
    pub fn new_client(&self) -> Result<Client> {
        let core = self.shared.pool.acquire()?;
        Ok(Client::new(core, Arc::clone(&self.shared)))
    }

    /// Visit every currently locked resource.
    ///
    /// The maps are snapshotted first; the visitor runs without holding any
    /// map guard and may call back into the manager.
    pub fn accept<F>(&self, mut visitor: F)
    where
        F: FnMut(&LockInfo<'_>),
    {
        let registry = self.shared.registry();
        for (resource_type, map) in self.shared.resource_types.iter().zip(&self.shared.lock_maps) {
            for (resource_id, lock) in map.snapshot() {
                let info = LockInfo {
                    resource_type,
                    resource_id,
                    mode: lock.mode(),
                    holders: lock.number_of_holders(),
                    update_lock: lock.is_update_lock(),
                    update_holder: lock.update_holder(),
                    description: lock.describe_wait_list(registry),
                    identity: lock.identity(),
                };
                visitor(&info);
            }
        }
    }

    /// Stop handing out clients. Clients already out keep working and
    /// release normally; they are disposed when closed.
    pub fn close(&self) {
        if self.shared.pool.is_closed() {
            return;
        }
        self.shared.pool.close();
        log::info!(
            "Lock manager closed with {} clients still active",
            self.shared.pool.active_count()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pool.is_closed()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn resource_types(&self) -> &[ResourceType] {
        &self.shared.resource_types
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Clients handed out and not yet closed
    pub fn active_client_count(&self) -> usize {
        self.shared.pool.active_count()
    }

    /// Number of resources currently locked
    pub fn locked_resource_count(&self) -> usize {
        self.shared.lock_maps.iter().map(LockMap::len).sum()
    }

    /// The lock currently installed on a resource, for diagnostics
    pub fn lock_of(&self, resource_type: &ResourceType, resource_id: ResourceId) -> Result<Option<Lock>> {
        let (_, map) = self.shared.lock_map(resource_type)?;
        Ok(map.get(resource_id))
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("resource_types", &self.shared.resource_types)
            .field("closed", &self.is_closed())
            .field("active_clients", &self.active_client_count())
            .finish()
    }
}
