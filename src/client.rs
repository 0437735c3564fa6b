//! Lock clients
//!
//! A [`Client`] is the per-transaction agent that acquires and releases locks.
//! Each client keeps local reference counts for every resource it holds, so
//! reentrant acquisitions never touch the global lock maps, and publishes a
//! wait-list that other clients read to detect deadlocks.
//!
//! The pooled, shareable part of a client lives in [`ClientCore`]; the
//! [`Client`] handle owns one core for its lifetime and gives it back to the
//! pool on close.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::common::{ClientId, LockError, LockMode, ResourceId, Result};
use crate::deadlock::{DeadlockParticipant, owner_graph_reaches};
use crate::lock::{ExclusiveLock, Lock, SharedLock};
use crate::lock_map::LockMap;
use crate::manager::ManagerShared;
use crate::resource::{IncrementalBackoff, ResourceType, WaitStrategy};
use crate::wait_list::{BitSet, WaitList};

/// Lifecycle state of a client, packed with its in-flight call count.
///
/// Layout: [stopped: 1][preparing: 1][active calls: 30]
#[derive(Debug)]
pub struct ClientState {
    bits: AtomicU32,
}

impl ClientState {
    const STOPPED: u32 = 1 << 31;
    const PREPARING: u32 = 1 << 30;
    const ACTIVE_MASK: u32 = Self::PREPARING - 1;

    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Register an in-flight call. Fails once the client is stopped.
    pub fn enter(&self) -> Option<ActiveGuard<'_>> {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & Self::STOPPED != 0 {
                return None;
            }
            debug_assert!(current & Self::ACTIVE_MASK < Self::ACTIVE_MASK);

            match self.bits.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ActiveGuard { state: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the client stopped. Only the first call succeeds; it also
    /// registers itself as an in-flight call so that the forced release that
    /// follows is waited for like any other operation.
    pub fn stop(&self) -> Option<ActiveGuard<'_>> {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & Self::STOPPED != 0 {
                return None;
            }

            match self.bits.compare_exchange_weak(
                current,
                (current + 1) | Self::STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ActiveGuard { state: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the preparing flag. Fails if the client is stopped.
    pub fn prepare(&self) -> bool {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & Self::STOPPED != 0 {
                return false;
            }

            match self.bits.compare_exchange_weak(
                current,
                current | Self::PREPARING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.bits.load(Ordering::Acquire) & Self::STOPPED != 0
    }

    pub fn is_preparing(&self) -> bool {
        self.bits.load(Ordering::Acquire) & Self::PREPARING != 0
    }

    pub fn active_calls(&self) -> u32 {
        self.bits.load(Ordering::Acquire) & Self::ACTIVE_MASK
    }

    /// Block until at most `allowed` calls are in flight
    pub fn wait_until_active_at_most(&self, allowed: u32) {
        let backoff = IncrementalBackoff::new(16, 16, Duration::from_millis(1));
        let mut iteration = 0u32;
        while self.active_calls() > allowed {
            backoff.apply(iteration);
            iteration = iteration.saturating_add(1);
        }
    }

    pub fn reset(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-flight call on a client; leaves the call on drop
pub struct ActiveGuard<'a> {
    state: &'a ClientState,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.state.bits.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A call made through one [`Client`] handle. `close` drains these before the
/// core goes back to the pool, so a stale handle never reaches a reused core.
struct HandleCall<'a> {
    calls: &'a AtomicU32,
}

impl Drop for HandleCall<'_> {
    fn drop(&mut self) {
        self.calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-resource-type local reference counts, owned by the client thread
struct LocalLocks {
    shared: Vec<AHashMap<ResourceId, u32>>,
    exclusive: Vec<AHashMap<ResourceId, u32>>,
    /// Scratch set for computing the next wait-list publication
    scratch: BitSet,
}

impl LocalLocks {
    fn new(resource_type_count: usize) -> Self {
        Self {
            shared: (0..resource_type_count).map(|_| AHashMap::new()).collect(),
            exclusive: (0..resource_type_count).map(|_| AHashMap::new()).collect(),
            scratch: BitSet::new(),
        }
    }

    fn lock_count(&self) -> usize {
        self.shared
            .iter()
            .chain(self.exclusive.iter())
            .map(|counts| counts.len())
            .sum()
    }
}

/// Clear `counts`, or replace it if it grew beyond `retain_capacity`
fn recycle_map(counts: &mut AHashMap<ResourceId, u32>, retain_capacity: usize) {
    if counts.capacity() > retain_capacity {
        *counts = AHashMap::new();
    } else {
        counts.clear();
    }
}

/// The pooled state of a client, visible to other clients through the registry
pub struct ClientCore {
    id: ClientId,
    wait_list: WaitList,
    waiting_for: Mutex<Option<Lock>>,
    /// Mirror of the local lock count for other clients' resolution strategies
    held: AtomicUsize,
    state: ClientState,
    exclusive_lock: Arc<ExclusiveLock>,
    local: Mutex<LocalLocks>,
}

impl ClientCore {
    pub fn new(id: ClientId, resource_type_count: usize) -> Self {
        Self {
            id,
            wait_list: WaitList::new(id),
            waiting_for: Mutex::new(None),
            held: AtomicUsize::new(0),
            state: ClientState::new(),
            exclusive_lock: Arc::new(ExclusiveLock::new(id)),
            local: Mutex::new(LocalLocks::new(resource_type_count)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// True if `other` is a different client and appears in this client's wait-list
    pub fn is_waiting_for(&self, other: ClientId) -> bool {
        other != self.id && self.wait_list.contains(other)
    }

    /// The lock this client is currently blocked on
    pub fn waiting_for_lock(&self) -> Option<Lock> {
        self.waiting_for.lock().clone()
    }

    pub fn describe_wait_list(&self) -> String {
        format!("{} waits for {}", self, self.wait_list)
    }

    fn mark_waiting_for(&self, lock: &Lock) {
        let mut waiting_for = self.waiting_for.lock();
        if !waiting_for.as_ref().is_some_and(|current| current.ptr_eq(lock)) {
            *waiting_for = Some(lock.clone());
        }
    }

    fn clear_waiting(&self) {
        self.wait_list.reset();
        *self.waiting_for.lock() = None;
    }

    fn publish_lock_count(&self, local: &LocalLocks) {
        self.held.store(local.lock_count(), Ordering::Relaxed);
    }

    /// Prepare for reuse by another transaction
    pub(crate) fn reset(&self) {
        self.clear_waiting();
        self.held.store(0, Ordering::Relaxed);
        self.state.reset();
    }
}

impl DeadlockParticipant for ClientCore {
    fn id(&self) -> ClientId {
        self.id
    }

    fn lock_count(&self) -> usize {
        self.held.load(Ordering::Relaxed)
    }

    fn wait_list_size(&self) -> usize {
        self.wait_list.size()
    }
}

impl fmt::Display for ClientCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client[{}]", self.id)
    }
}

impl fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCore")
            .field("id", &self.id)
            .field("wait_list", &self.wait_list)
            .field("held", &self.held.load(Ordering::Relaxed))
            .field("state", &self.state)
            .finish()
    }
}

/// A lock held by a client, as reported by [`Client::active_locks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    pub resource_type: ResourceType,
    pub resource_id: ResourceId,
    pub mode: LockMode,
}

/// Per-acquisition bookkeeping for a wait loop
struct WaitContext<'a> {
    resource_type: &'a ResourceType,
    resource_id: ResourceId,
    mode: LockMode,
    started: Instant,
    tries: u32,
    waited: bool,
}

/// A lock client, handed out by [`LockManager::new_client`](crate::LockManager::new_client).
///
/// All operations take `&self`; `stop` may be called from another thread to
/// abort a client that is blocked in a wait. Closing (explicitly or on drop)
/// releases every lock still held and returns the client to the pool.
pub struct Client {
    core: Arc<ClientCore>,
    manager: Arc<ManagerShared>,
    closed: AtomicBool,
    /// Calls in flight through this handle
    calls: AtomicU32,
}

impl Client {
    pub(crate) fn new(core: Arc<ClientCore>, manager: Arc<ManagerShared>) -> Self {
        Self {
            core,
            manager,
            closed: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.core.id
    }

    /// Pin the core to this handle for the duration of a call. Fails once
    /// the handle is closed.
    fn pin(&self) -> Option<HandleCall<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = HandleCall { calls: &self.calls };
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(call)
    }

    fn enter(&self) -> Result<(ActiveGuard<'_>, HandleCall<'_>)> {
        let call = self.pin().ok_or_else(|| self.stopped())?;
        let active = self.core.state.enter().ok_or_else(|| self.stopped())?;
        Ok((active, call))
    }

    /// Block until no call made through this handle is in flight
    fn drain_handle_calls(&self) {
        let backoff = IncrementalBackoff::new(16, 16, Duration::from_millis(1));
        let mut iteration = 0u32;
        while self.calls.load(Ordering::SeqCst) > 0 {
            backoff.apply(iteration);
            iteration = iteration.saturating_add(1);
        }
    }

    fn stopped(&self) -> LockError {
        LockError::ClientStopped {
            client_id: self.core.id,
        }
    }

    fn ensure_not_preparing(&self) -> Result<()> {
        if self.core.state.is_preparing() {
            return Err(LockError::ClientPreparing {
                client_id: self.core.id,
            });
        }
        Ok(())
    }

    fn my_lock(&self) -> Lock {
        Lock::Exclusive(Arc::clone(&self.core.exclusive_lock))
    }

    /// Acquire shared locks on each of `resource_ids`, waiting as needed
    pub fn acquire_shared(&self, resource_type: &ResourceType, resource_ids: &[ResourceId]) -> Result<()> {
        let _active = self.enter()?;
        let (index, map) = self.manager.lock_map(resource_type)?;
        let mut local = self.core.local.lock();

        resource_ids.iter().try_for_each(|&resource_id| {
            let result = self.acquire_shared_one(&mut local, index, map, resource_type, resource_id);
            self.core.publish_lock_count(&local);
            result
        })
    }

    /// Acquire exclusive locks on each of `resource_ids`, waiting as needed.
    ///
    /// A shared lock held by this client is upgraded once the other shared
    /// holders have drained.
    pub fn acquire_exclusive(&self, resource_type: &ResourceType, resource_ids: &[ResourceId]) -> Result<()> {
        let _active = self.enter()?;
        let (index, map) = self.manager.lock_map(resource_type)?;
        let mut local = self.core.local.lock();

        resource_ids.iter().try_for_each(|&resource_id| {
            let result = self.acquire_exclusive_one(&mut local, index, map, resource_type, resource_id);
            self.core.publish_lock_count(&local);
            result
        })
    }

    /// Try once to take a shared lock, without waiting
    pub fn try_shared_lock(&self, resource_type: &ResourceType, resource_id: ResourceId) -> bool {
        let Ok(_active) = self.enter() else {
            return false;
        };
        let Ok((index, map)) = self.manager.lock_map(resource_type) else {
            return false;
        };
        let mut local = self.core.local.lock();

        let acquired = match Self::re_enter_shared_locally(&mut local, index, resource_id) {
            Some(reentered) => {
                if reentered {
                    self.manager.stats.record_reentrant();
                }
                reentered
            }
            None => {
                if self.core.state.is_preparing() {
                    return false;
                }
                let installed = self.try_install_shared(map, resource_id);
                if installed {
                    local.shared[index].insert(resource_id, 1);
                    self.manager.stats.record_acquired(LockMode::Shared);
                }
                installed
            }
        };
        self.core.publish_lock_count(&local);
        acquired
    }

    /// Try once to take an exclusive lock, without waiting.
    ///
    /// Succeeds on a shared lock only if this client is its sole holder.
    pub fn try_exclusive_lock(&self, resource_type: &ResourceType, resource_id: ResourceId) -> bool {
        let Ok(_active) = self.enter() else {
            return false;
        };
        let Ok((index, map)) = self.manager.lock_map(resource_type) else {
            return false;
        };
        let mut local = self.core.local.lock();

        if let Some(count) = local.exclusive[index].get_mut(&resource_id) {
            let Some(next) = count.checked_add(1) else {
                return false;
            };
            *count = next;
            self.manager.stats.record_reentrant();
            return true;
        }

        if self.core.state.is_preparing() {
            return false;
        }

        let acquired = match map.insert_if_absent(resource_id, self.my_lock()) {
            None => true,
            Some(Lock::Shared(shared)) if local.shared[index].contains_key(&resource_id) => {
                if !shared.try_acquire_update_lock(self.core.id) {
                    false
                } else if shared.number_of_holders() == 1 {
                    self.manager.stats.record_upgrade();
                    true
                } else {
                    shared.release_update_lock();
                    false
                }
            }
            Some(_) => false,
        };

        if acquired {
            local.exclusive[index].insert(resource_id, 1);
            self.manager.stats.record_acquired(LockMode::Exclusive);
            self.core.publish_lock_count(&local);
        }
        acquired
    }

    /// Take another shared reference on a lock this client already holds.
    /// Never touches the global lock maps.
    pub fn re_enter_shared(&self, resource_type: &ResourceType, resource_id: ResourceId) -> bool {
        let Ok(_active) = self.enter() else {
            return false;
        };
        let Ok((index, _)) = self.manager.lock_map(resource_type) else {
            return false;
        };
        let mut local = self.core.local.lock();
        let reentered = Self::re_enter_shared_locally(&mut local, index, resource_id) == Some(true);
        if reentered {
            self.manager.stats.record_reentrant();
            self.core.publish_lock_count(&local);
        }
        reentered
    }

    /// Take another exclusive reference on a lock this client already holds exclusively
    pub fn re_enter_exclusive(&self, resource_type: &ResourceType, resource_id: ResourceId) -> bool {
        let Ok(_active) = self.enter() else {
            return false;
        };
        let Ok((index, _)) = self.manager.lock_map(resource_type) else {
            return false;
        };
        let mut local = self.core.local.lock();
        match local.exclusive[index].get_mut(&resource_id) {
            Some(count) => match count.checked_add(1) {
                Some(next) => {
                    *count = next;
                    self.manager.stats.record_reentrant();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Local reentry: `None` if the resource is not held at all, otherwise
    /// whether the reference could be taken
    fn re_enter_shared_locally(local: &mut LocalLocks, index: usize, resource_id: ResourceId) -> Option<bool> {
        if let Some(count) = local.shared[index].get_mut(&resource_id) {
            return Some(match count.checked_add(1) {
                Some(next) => {
                    *count = next;
                    true
                }
                None => false,
            });
        }

        // Latent shared reference under our exclusive lock
        if local.exclusive[index].contains_key(&resource_id) {
            local.shared[index].insert(resource_id, 1);
            return Some(true);
        }

        None
    }

    /// One non-blocking attempt at joining or installing a shared lock
    fn try_install_shared(&self, map: &LockMap, resource_id: ResourceId) -> bool {
        loop {
            match map.get(resource_id) {
                None => {
                    let lock = Lock::Shared(Arc::new(SharedLock::new(self.core.id)));
                    if map.insert_if_absent(resource_id, lock).is_none() {
                        return true;
                    }
                }
                Some(Lock::Shared(shared)) => {
                    if shared.acquire(self.core.id) {
                        return true;
                    }
                    if !shared.is_dead() {
                        return false;
                    }
                }
                Some(Lock::Exclusive(_)) => return false,
            }
        }
    }

    fn acquire_shared_one(
        &self,
        local: &mut LocalLocks,
        index: usize,
        map: &LockMap,
        resource_type: &ResourceType,
        resource_id: ResourceId,
    ) -> Result<()> {
        match Self::re_enter_shared_locally(local, index, resource_id) {
            Some(true) => {
                self.manager.stats.record_reentrant();
                return Ok(());
            }
            Some(false) => {
                return Err(self.overflow(resource_type, resource_id, LockMode::Shared));
            }
            None => {}
        }
        self.ensure_not_preparing()?;

        let mut wait = WaitContext {
            resource_type,
            resource_id,
            mode: LockMode::Shared,
            started: Instant::now(),
            tries: 0,
            waited: false,
        };

        let result = loop {
            let blocking = match map.get(resource_id) {
                None => {
                    let lock = Lock::Shared(Arc::new(SharedLock::new(self.core.id)));
                    if map.insert_if_absent(resource_id, lock).is_none() {
                        break Ok(());
                    }
                    continue;
                }
                Some(Lock::Shared(shared)) => {
                    if shared.acquire(self.core.id) {
                        break Ok(());
                    }
                    if shared.is_dead() {
                        continue;
                    }
                    Lock::Shared(shared)
                }
                Some(lock @ Lock::Exclusive(_)) => lock,
            };

            if let Err(err) = self.wait_for(&blocking, &mut local.scratch, &mut wait) {
                break Err(err);
            }
        };

        self.finish_wait(&wait, &result);
        result?;

        local.shared[index].insert(resource_id, 1);
        self.manager.stats.record_acquired(LockMode::Shared);
        Ok(())
    }

    fn acquire_exclusive_one(
        &self,
        local: &mut LocalLocks,
        index: usize,
        map: &LockMap,
        resource_type: &ResourceType,
        resource_id: ResourceId,
    ) -> Result<()> {
        if let Some(count) = local.exclusive[index].get_mut(&resource_id) {
            *count = count
                .checked_add(1)
                .ok_or_else(|| self.overflow(resource_type, resource_id, LockMode::Exclusive))?;
            self.manager.stats.record_reentrant();
            return Ok(());
        }
        self.ensure_not_preparing()?;

        let my_lock = self.my_lock();
        let holds_shared = local.shared[index].contains_key(&resource_id);
        let mut wait = WaitContext {
            resource_type,
            resource_id,
            mode: LockMode::Exclusive,
            started: Instant::now(),
            tries: 0,
            waited: false,
        };

        let result = loop {
            let blocking = match map.insert_if_absent(resource_id, my_lock.clone()) {
                None => break Ok(false),
                Some(existing) => existing,
            };

            if let Lock::Shared(shared) = &blocking
                && wait.tries >= self.manager.config.upgrade_grace_tries
            {
                match self.try_upgrade(map, shared, &blocking, holds_shared, &mut local.scratch, &mut wait) {
                    Ok(true) => break Ok(true),
                    Ok(false) => {}
                    Err(err) => break Err(err),
                }
            }

            if let Err(err) = self.wait_for(&blocking, &mut local.scratch, &mut wait) {
                break Err(err);
            }
        };

        self.finish_wait(&wait, &result);
        let upgraded = result?;

        local.exclusive[index].insert(resource_id, 1);
        self.manager.stats.record_acquired(LockMode::Exclusive);
        if upgraded {
            self.manager.stats.record_upgrade();
        }
        Ok(())
    }

    /// Upgrade `shared` to an exclusive hold: join it if needed, take the
    /// update flag, then wait for every other holder to leave.
    ///
    /// Returns `Ok(false)` if the update flag could not be taken; the caller
    /// keeps waiting.
    fn try_upgrade(
        &self,
        map: &LockMap,
        shared: &Arc<SharedLock>,
        lock: &Lock,
        holds_shared: bool,
        scratch: &mut BitSet,
        wait: &mut WaitContext<'_>,
    ) -> Result<bool> {
        if !holds_shared && !shared.acquire(self.core.id) {
            return Ok(false);
        }

        let result = self.upgrade_held(shared, lock, scratch, wait);
        if !holds_shared && !matches!(result, Ok(true)) {
            self.release_global(map, wait.resource_id);
        }
        result
    }

    fn upgrade_held(
        &self,
        shared: &SharedLock,
        lock: &Lock,
        scratch: &mut BitSet,
        wait: &mut WaitContext<'_>,
    ) -> Result<bool> {
        if !shared.try_acquire_update_lock(self.core.id) {
            return Ok(false);
        }
        log::trace!(
            "{} holds the update lock on {}({})",
            self.core,
            wait.resource_type,
            wait.resource_id
        );

        while shared.number_of_holders() > 1 {
            if let Err(err) = self.wait_for(lock, scratch, wait) {
                shared.release_update_lock();
                return Err(err);
            }
        }
        Ok(true)
    }

    /// One wait iteration on `lock`: publish the wait-list, back off, then
    /// check for timeouts, stops and deadlocks
    fn wait_for(&self, lock: &Lock, scratch: &mut BitSet, wait: &mut WaitContext<'_>) -> Result<()> {
        let core = &self.core;
        wait.waited = true;
        if core.state.is_stopped() {
            return Err(self.stopped());
        }

        if wait.tries == 0 {
            log::trace!(
                "{} waiting for {} lock on {}({})",
                core,
                wait.mode,
                wait.resource_type,
                wait.resource_id
            );
        }

        core.mark_waiting_for(lock);
        scratch.clear();
        scratch.insert(core.id);
        lock.copy_holder_wait_lists_into(self.manager.registry(), core.id, scratch);
        core.wait_list.publish(scratch);

        wait.resource_type.wait_strategy().apply(wait.tries);

        if let Some(timeout) = self.manager.config.lock_acquisition_timeout() {
            let waited = wait.started.elapsed();
            if waited > timeout {
                log::debug!(
                    "{} timed out waiting for {} lock on {}({})",
                    core,
                    wait.mode,
                    wait.resource_type,
                    wait.resource_id
                );
                return Err(LockError::AcquisitionTimeout {
                    client_id: core.id,
                    resource_type: wait.resource_type.name().to_string(),
                    resource_id: wait.resource_id,
                    mode: wait.mode,
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }

        self.check_deadlock(lock, wait)?;
        wait.tries = wait.tries.saturating_add(1);
        Ok(())
    }

    fn check_deadlock(&self, lock: &Lock, wait: &WaitContext<'_>) -> Result<()> {
        let registry = self.manager.registry();
        let Some(other_id) = lock.any_holder_is_waiting_for(registry, self.core.id) else {
            return Ok(());
        };
        let Some(other) = registry.get(other_id) else {
            return Ok(());
        };

        if !self
            .manager
            .config
            .deadlock_resolution
            .should_abort(self.core.as_ref(), other.as_ref())
        {
            return Ok(());
        }

        if !self.is_deadlock_real(lock, wait.tries) {
            self.manager.stats.record_false_deadlock();
            return Ok(());
        }

        let mut message = format!(
            "{} can't acquire {} lock on {}({}) because holders of that lock are waiting for {}",
            self.core, wait.mode, wait.resource_type, wait.resource_id, self.core
        );
        if self.manager.config.verbose_deadlocks {
            message.push_str("\n Wait list:");
            message.push_str(&lock.describe_wait_list(registry));
        }
        log::warn!("{}", message);

        Err(LockError::Deadlock {
            client_id: self.core.id,
            message,
        })
    }

    /// Confirm a deadlock candidate against the live owner graph. Early
    /// sightings are rechecked once after a short pause.
    fn is_deadlock_real(&self, lock: &Lock, tries: u32) -> bool {
        let registry = self.manager.registry();
        if !owner_graph_reaches(registry, lock, self.core.id) {
            return false;
        }
        if tries >= self.manager.config.deadlock_verification_tries {
            return true;
        }

        thread::sleep(self.manager.config.deadlock_verification_pause());
        owner_graph_reaches(registry, lock, self.core.id)
    }

    fn finish_wait<T>(&self, wait: &WaitContext<'_>, result: &Result<T>) {
        if !wait.waited {
            return;
        }
        self.core.clear_waiting();
        self.manager.stats.record_wait();
        if let Err(err) = result {
            self.manager.stats.record_error(err);
        }
    }

    fn overflow(&self, resource_type: &ResourceType, resource_id: ResourceId, mode: LockMode) -> LockError {
        LockError::ReferenceCountOverflow {
            client_id: self.core.id,
            resource_type: resource_type.name().to_string(),
            resource_id,
            mode,
        }
    }

    fn not_held(&self, resource_type: &ResourceType, resource_id: ResourceId, mode: LockMode) -> LockError {
        LockError::NotHeld {
            client_id: self.core.id,
            resource_type: resource_type.name().to_string(),
            resource_id,
            mode,
        }
    }

    /// Release one shared reference on each of `resource_ids`
    pub fn release_shared(&self, resource_type: &ResourceType, resource_ids: &[ResourceId]) -> Result<()> {
        let _active = self.enter()?;
        let (index, map) = self.manager.lock_map(resource_type)?;
        let mut local = self.core.local.lock();

        let result = resource_ids.iter().try_for_each(|&resource_id| {
            let Some(count) = local.shared[index].get_mut(&resource_id) else {
                return Err(self.not_held(resource_type, resource_id, LockMode::Shared));
            };
            if *count > 1 {
                *count -= 1;
                return Ok(());
            }

            local.shared[index].remove(&resource_id);
            if !local.exclusive[index].contains_key(&resource_id) {
                self.release_global(map, resource_id);
            }
            Ok(())
        });
        self.core.publish_lock_count(&local);
        result
    }

    /// Release one exclusive reference on each of `resource_ids`.
    ///
    /// Releasing the last exclusive reference while still holding shared
    /// references downgrades the lock instead of freeing it.
    pub fn release_exclusive(&self, resource_type: &ResourceType, resource_ids: &[ResourceId]) -> Result<()> {
        let _active = self.enter()?;
        let (index, map) = self.manager.lock_map(resource_type)?;
        let mut local = self.core.local.lock();

        let result = resource_ids.iter().try_for_each(|&resource_id| {
            let Some(count) = local.exclusive[index].get_mut(&resource_id) else {
                return Err(self.not_held(resource_type, resource_id, LockMode::Exclusive));
            };
            if *count > 1 {
                *count -= 1;
                return Ok(());
            }

            local.exclusive[index].remove(&resource_id);
            if local.shared[index].contains_key(&resource_id) {
                self.downgrade(map, resource_id);
            } else {
                self.release_global(map, resource_id);
            }
            Ok(())
        });
        self.core.publish_lock_count(&local);
        result
    }

    fn downgrade(&self, map: &LockMap, resource_id: ResourceId) {
        match map.get(resource_id) {
            Some(lock @ Lock::Exclusive(_)) => {
                let replacement = Lock::Shared(Arc::new(SharedLock::new(self.core.id)));
                map.replace_if_same(resource_id, &lock, replacement);
            }
            Some(Lock::Shared(shared)) => shared.release_update_lock(),
            None => {}
        }
    }

    /// Drop this client's hold on the global lock of `resource_id`
    fn release_global(&self, map: &LockMap, resource_id: ResourceId) {
        match map.get(resource_id) {
            Some(lock @ Lock::Exclusive(_)) => {
                if lock.ptr_eq(&self.my_lock()) {
                    map.remove_if_same(resource_id, &lock);
                }
            }
            Some(Lock::Shared(shared)) => {
                if shared.release(self.core.id) {
                    shared.clean_update_holder();
                    map.remove_if_same(resource_id, &Lock::Shared(shared));
                }
            }
            None => {}
        }
    }

    /// Release every lock held, exclusive holdings first
    fn release_all_locks(&self) {
        let retain = self.manager.config.local_map_retain_capacity;
        let mut local = self.core.local.lock();
        let local = &mut *local;

        for (index, map) in self.manager.lock_maps.iter().enumerate() {
            for &resource_id in local.exclusive[index].keys() {
                local.shared[index].remove(&resource_id);
                self.release_global(map, resource_id);
            }
            for &resource_id in local.shared[index].keys() {
                self.release_global(map, resource_id);
            }
            recycle_map(&mut local.exclusive[index], retain);
            recycle_map(&mut local.shared[index], retain);
        }
        self.core.publish_lock_count(local);
    }

    /// Enter the prepare phase: locks already held can be re-entered and
    /// released, but no new locks can be taken
    pub fn prepare(&self) -> Result<()> {
        let _call = self.pin().ok_or_else(|| self.stopped())?;
        if !self.core.state.prepare() {
            return Err(self.stopped());
        }
        Ok(())
    }

    /// Stop the client and release all its locks. A wait in progress on
    /// another thread fails with [`LockError::ClientStopped`].
    pub fn stop(&self) {
        let Some(_call) = self.pin() else {
            return;
        };
        if let Some(_stopping) = self.core.state.stop() {
            self.core.state.wait_until_active_at_most(1);
            self.release_all_locks();
            log::debug!("Stopped {}", self.core);
        }
    }

    /// Stop the client, release its locks and return it to the pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(_stopping) = self.core.state.stop() {
            self.core.state.wait_until_active_at_most(1);
            self.release_all_locks();
        }
        // Every call that pinned the core before `closed` was set must leave
        // before the core can be handed to another transaction.
        self.drain_handle_calls();
        self.core.state.wait_until_active_at_most(0);
        self.manager.pool.release(Arc::clone(&self.core));
    }

    pub fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.core.state.is_stopped()
    }

    pub fn is_preparing(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.core.state.is_preparing()
    }

    /// Whether this client holds `resource_id` in the given mode
    pub fn holds_lock(&self, resource_type: &ResourceType, resource_id: ResourceId, mode: LockMode) -> bool {
        let Some(_call) = self.pin() else {
            return false;
        };
        let Ok((index, _)) = self.manager.lock_map(resource_type) else {
            return false;
        };
        let local = self.core.local.lock();
        match mode {
            LockMode::Shared => local.shared[index].contains_key(&resource_id),
            LockMode::Exclusive => local.exclusive[index].contains_key(&resource_id),
        }
    }

    /// Every (resource, mode) this client holds
    pub fn active_locks(&self) -> Vec<ActiveLock> {
        let Some(_call) = self.pin() else {
            return Vec::new();
        };
        let local = self.core.local.lock();
        let mut locks = Vec::with_capacity(local.lock_count());
        for (index, resource_type) in self.manager.resource_types.iter().enumerate() {
            let modes = [
                (LockMode::Exclusive, &local.exclusive[index]),
                (LockMode::Shared, &local.shared[index]),
            ];
            for (mode, counts) in modes {
                locks.extend(counts.keys().map(|&resource_id| ActiveLock {
                    resource_type: resource_type.clone(),
                    resource_id,
                    mode,
                }));
            }
        }
        locks
    }

    pub fn active_lock_count(&self) -> u64 {
        let Some(_call) = self.pin() else {
            return 0;
        };
        self.core.local.lock().lock_count() as u64
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client[{}]", self.core.id)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.core.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::manager::LockManager;

    fn node() -> ResourceType {
        ResourceType::new(0, "Node")
    }

    fn relationship() -> ResourceType {
        ResourceType::new(1, "Relationship")
    }

    fn manager() -> LockManager {
        LockManager::new(Config::default(), vec![node(), relationship()]).unwrap()
    }

    fn global_holders(manager: &LockManager, resource_id: ResourceId) -> Option<(LockMode, u32)> {
        let mut found = None;
        manager.accept(|info| {
            if info.resource_type.id() == 0 && info.resource_id == resource_id {
                found = Some((info.mode, info.holders));
            }
        });
        found
    }

    #[test]
    fn test_client_state_transitions() {
        let state = ClientState::new();
        {
            let _a = state.enter().unwrap();
            let _b = state.enter().unwrap();
            assert_eq!(state.active_calls(), 2);
        }
        assert_eq!(state.active_calls(), 0);

        assert!(state.prepare());
        assert!(state.is_preparing());

        let stopping = state.stop().unwrap();
        assert!(state.is_stopped());
        assert!(state.stop().is_none());
        assert!(state.enter().is_none());
        assert!(!state.prepare());
        assert_eq!(state.active_calls(), 1);
        drop(stopping);
        state.wait_until_active_at_most(0);

        state.reset();
        assert!(!state.is_stopped());
        assert!(!state.is_preparing());
    }

    #[test]
    fn test_reentrant_shared() {
        let manager = manager();
        let client = manager.new_client().unwrap();

        client.acquire_shared(&node(), &[1]).unwrap();
        client.acquire_shared(&node(), &[1]).unwrap();
        assert!(client.re_enter_shared(&node(), 1));
        assert_eq!(global_holders(&manager, 1), Some((LockMode::Shared, 1)));
        assert_eq!(client.active_lock_count(), 1);

        client.release_shared(&node(), &[1, 1]).unwrap();
        assert!(client.holds_lock(&node(), 1, LockMode::Shared));
        client.release_shared(&node(), &[1]).unwrap();
        assert!(!client.holds_lock(&node(), 1, LockMode::Shared));
        assert_eq!(global_holders(&manager, 1), None);

        let stats = manager.stats();
        assert_eq!(stats.shared_acquired, 1);
        assert_eq!(stats.reentrant_acquired, 2);
    }

    #[test]
    fn test_exclusive_with_latent_shared_downgrades() {
        let manager = manager();
        let client = manager.new_client().unwrap();

        client.acquire_exclusive(&node(), &[7]).unwrap();
        client.acquire_shared(&node(), &[7]).unwrap();
        assert_eq!(client.active_lock_count(), 2);

        client.release_exclusive(&node(), &[7]).unwrap();
        assert_eq!(global_holders(&manager, 7), Some((LockMode::Shared, 1)));

        let other = manager.new_client().unwrap();
        assert!(other.try_shared_lock(&node(), 7));
        assert_eq!(global_holders(&manager, 7), Some((LockMode::Shared, 2)));
        assert!(!other.try_exclusive_lock(&node(), 7));

        client.release_shared(&node(), &[7]).unwrap();
        other.release_shared(&node(), &[7]).unwrap();
        assert_eq!(global_holders(&manager, 7), None);
    }

    #[test]
    fn test_sole_shared_holder_upgrades_and_downgrades() {
        let manager = manager();
        let client = manager.new_client().unwrap();

        client.acquire_shared(&node(), &[3]).unwrap();
        client.acquire_exclusive(&node(), &[3]).unwrap();
        assert!(client.holds_lock(&node(), 3, LockMode::Exclusive));

        let other = manager.new_client().unwrap();
        assert!(!other.try_shared_lock(&node(), 3));

        client.release_exclusive(&node(), &[3]).unwrap();
        assert_eq!(global_holders(&manager, 3), Some((LockMode::Shared, 1)));
        assert!(other.try_shared_lock(&node(), 3));
        assert_eq!(manager.stats().upgrades, 1);
    }

    #[test]
    fn test_try_locks_fail_fast() {
        let manager = manager();
        let a = manager.new_client().unwrap();
        let b = manager.new_client().unwrap();

        assert!(a.try_exclusive_lock(&node(), 1));
        assert!(a.try_exclusive_lock(&node(), 1));
        assert!(!b.try_shared_lock(&node(), 1));
        assert!(!b.try_exclusive_lock(&node(), 1));

        // the other resource type is independent
        assert!(b.try_exclusive_lock(&relationship(), 1));

        a.release_exclusive(&node(), &[1, 1]).unwrap();
        assert!(b.try_shared_lock(&node(), 1));
        assert!(b.try_exclusive_lock(&node(), 1));
    }

    #[test]
    fn test_re_enter_requires_existing_hold() {
        let manager = manager();
        let client = manager.new_client().unwrap();

        assert!(!client.re_enter_shared(&node(), 4));
        assert!(!client.re_enter_exclusive(&node(), 4));

        client.acquire_exclusive(&node(), &[4]).unwrap();
        assert!(client.re_enter_exclusive(&node(), 4));
        assert!(client.re_enter_shared(&node(), 4));
        assert_eq!(client.active_locks().len(), 2);
    }

    #[test]
    fn test_release_of_unheld_lock_is_misuse() {
        let manager = manager();
        let client = manager.new_client().unwrap();

        let err = client.release_shared(&node(), &[9]).unwrap_err();
        assert!(err.is_misuse());
        assert!(matches!(err, LockError::NotHeld { mode: LockMode::Shared, .. }));

        client.acquire_shared(&node(), &[9]).unwrap();
        let err = client.release_exclusive(&node(), &[9]).unwrap_err();
        assert!(matches!(err, LockError::NotHeld { mode: LockMode::Exclusive, .. }));
        assert!(client.holds_lock(&node(), 9, LockMode::Shared));
    }

    #[test]
    fn test_reference_count_overflow() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        client.acquire_shared(&node(), &[2]).unwrap();
        client.core.local.lock().shared[0].insert(2, u32::MAX);

        let err = client.acquire_shared(&node(), &[2]).unwrap_err();
        assert!(matches!(err, LockError::ReferenceCountOverflow { .. }));
        assert!(!client.re_enter_shared(&node(), 2));
    }

    #[test]
    fn test_unknown_resource_type() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let label = ResourceType::new(5, "Label");
        let err = client.acquire_shared(&label, &[1]).unwrap_err();
        assert!(matches!(err, LockError::UnknownResourceType { id: 5, .. }));
        assert!(!client.try_shared_lock(&label, 1));

        let impostor = ResourceType::new(0, "Schema");
        assert!(client.acquire_exclusive(&impostor, &[1]).is_err());
    }

    #[test]
    fn test_prepare_blocks_new_locks_only() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        client.acquire_shared(&node(), &[1]).unwrap();
        client.prepare().unwrap();
        assert!(client.is_preparing());

        client.acquire_shared(&node(), &[1]).unwrap();
        let err = client.acquire_shared(&node(), &[2]).unwrap_err();
        assert!(matches!(err, LockError::ClientPreparing { .. }));
        assert!(!client.try_exclusive_lock(&node(), 3));

        client.release_shared(&node(), &[1, 1]).unwrap();
        assert_eq!(client.active_lock_count(), 0);
    }

    #[test]
    fn test_stopped_client_rejects_operations() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        client.acquire_exclusive(&node(), &[1]).unwrap();
        client.acquire_shared(&relationship(), &[2]).unwrap();

        client.stop();
        client.stop();
        assert!(client.is_stopped());
        assert_eq!(global_holders(&manager, 1), None);

        assert!(matches!(
            client.acquire_shared(&node(), &[1]),
            Err(LockError::ClientStopped { .. })
        ));
        assert!(matches!(
            client.release_exclusive(&node(), &[1]),
            Err(LockError::ClientStopped { .. })
        ));
        assert!(!client.try_shared_lock(&node(), 1));
        assert!(client.prepare().is_err());
        assert_eq!(client.active_lock_count(), 0);

        client.close();
        client.close();
        assert!(client.is_stopped());
    }

    #[test]
    fn test_close_releases_and_returns_to_pool() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let id = client.id();
        client.acquire_exclusive(&node(), &[1, 2, 3]).unwrap();
        client.acquire_shared(&node(), &[2]).unwrap();
        assert_eq!(manager.active_client_count(), 1);

        drop(client);
        assert_eq!(manager.active_client_count(), 0);
        for resource_id in 1..=3 {
            assert_eq!(global_holders(&manager, resource_id), None);
        }

        let reused = manager.new_client().unwrap();
        assert_eq!(reused.id(), id);
        assert!(!reused.is_stopped());
        assert_eq!(reused.active_lock_count(), 0);
        reused.acquire_exclusive(&node(), &[1]).unwrap();
    }

    #[test]
    fn test_wait_list_description() {
        let core = ClientCore::new(3, 1);
        assert_eq!(core.describe_wait_list(), "Client[3] waits for [3]");
        assert!(!core.is_waiting_for(3));
        assert_eq!(core.lock_count(), 0);
        assert!(core.waiting_for_lock().is_none());
    }
}
