//! Client pooling and id lookup
//!
//! Client ids index the wait-list bitsets, so they are kept small: disposed
//! clients hand their id back for reuse and the smallest free id is handed out
//! first. Lock holder slots store ids rather than references; the registry
//! resolves them back to live clients.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::client::ClientCore;
use crate::common::{ClientId, LockError, Result};
use crate::stats::SharedLockStats;

/// Id -> client lookup for every client a pool has created and not yet disposed
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientCore>, ahash::RandomState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientCore>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn register(&self, client: Arc<ClientCore>) {
        self.clients.insert(client.id(), client);
    }

    pub fn unregister(&self, id: ClientId) -> Option<Arc<ClientCore>> {
        self.clients.remove(&id).map(|(_, client)| client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolState {
    idle: Vec<Arc<ClientCore>>,
    unused_ids: BinaryHeap<Reverse<ClientId>>,
    next_id: ClientId,
    /// Clients handed out and not yet returned
    active: usize,
    closed: bool,
}

/// Pool of reusable client cores
pub struct ClientPool {
    registry: ClientRegistry,
    state: Mutex<PoolState>,
    resource_type_count: usize,
    max_idle: usize,
    recycled_id_limit: ClientId,
    stats: SharedLockStats,
}

impl ClientPool {
    pub fn new(
        resource_type_count: usize,
        max_idle: usize,
        recycled_id_limit: ClientId,
        stats: SharedLockStats,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                unused_ids: BinaryHeap::new(),
                next_id: 0,
                active: 0,
                closed: false,
            }),
            resource_type_count,
            max_idle,
            recycled_id_limit,
            stats,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Hand out an idle client, or create one with the smallest free id
    pub fn acquire(&self) -> Result<Arc<ClientCore>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LockError::ManagerClosed);
        }
        state.active += 1;

        if let Some(core) = state.idle.pop() {
            drop(state);
            self.stats.record_client_reused();
            return Ok(core);
        }

        let id = match state.unused_ids.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };

        let core = Arc::new(ClientCore::new(id, self.resource_type_count));
        self.registry.register(Arc::clone(&core));
        drop(state);

        self.stats.record_client_created();
        log::debug!("Created client {}", id);
        Ok(core)
    }

    /// Take a client back. It must hold no locks and have no calls in flight.
    pub fn release(&self, core: Arc<ClientCore>) {
        core.reset();
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);

        if !state.closed && state.idle.len() < self.max_idle {
            state.idle.push(core);
            return;
        }

        self.dispose(&mut state, &core);
    }

    fn dispose(&self, state: &mut PoolState, core: &ClientCore) {
        let id = core.id();
        self.registry.unregister(id);
        if id < self.recycled_id_limit {
            state.unused_ids.push(Reverse(id));
        }
        self.stats.record_client_disposed();
        log::debug!("Disposed client {}", id);
    }

    /// Refuse further clients and dispose the idle ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        for core in &idle {
            self.dispose(&mut state, core);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }
}
