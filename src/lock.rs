//! Shared and exclusive lock objects
//!
//! These are the values installed into the per-resource-type lock maps. A
//! resource is locked iff its map slot holds a `Lock`; the lock object then
//! records who holds it so that waiters can read the holders' wait-lists.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::AHashSet;

use crate::common::{ClientId, LockMode};
use crate::pool::ClientRegistry;
use crate::wait_list::BitSet;

/// Holder segment sizes. Segments are allocated on demand.
const SEGMENT_SIZES: [usize; 4] = [8, 64, 512, 4096];

/// Maximum number of clients that may hold one shared lock at the same time
pub const MAX_HOLDERS: u32 = 4680;

/// Marks a holder slot as free. Occupied slots store `client id + 1`.
const EMPTY_SLOT: u32 = 0;

/// Passes over the holder segments before giving up on finding a free slot
const INSERT_PASSES: usize = 3;

#[inline]
fn slot_tag(client: ClientId) -> u32 {
    debug_assert!(client < u32::MAX);
    client + 1
}

#[inline]
fn slot_client(tag: u32) -> Option<ClientId> {
    tag.checked_sub(1)
}

/// Exclusive lock, held by exactly one client.
///
/// Every client owns one instance and installs it for every resource it locks
/// exclusively; only its identity inside a map slot matters.
#[derive(Debug)]
pub struct ExclusiveLock {
    owner: ClientId,
}

impl ExclusiveLock {
    pub fn new(owner: ClientId) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }
}

/// Shared lock with a bounded, lock-free holder table.
///
/// Layout of `state`: [update: 1][holder count: 31]. The update flag lives in
/// the top bit, so a set flag makes the whole word larger than any count.
#[derive(Debug)]
pub struct SharedLock {
    state: AtomicU32,
    segments: [OnceLock<Box<[AtomicU32]>>; 4],
    update_holder: AtomicU32,
}

impl SharedLock {
    const UPDATE_LOCK_FLAG: u32 = 1 << 31;
    const COUNT_MASK: u32 = !Self::UPDATE_LOCK_FLAG;

    /// Creates a shared lock held by `holder`
    pub fn new(holder: ClientId) -> Self {
        let lock = Self {
            state: AtomicU32::new(1),
            segments: Default::default(),
            update_holder: AtomicU32::new(EMPTY_SLOT),
        };
        lock.segment(0)[0].store(slot_tag(holder), Ordering::Release);
        lock
    }

    fn segment(&self, index: usize) -> &[AtomicU32] {
        self.segments[index].get_or_init(|| {
            (0..SEGMENT_SIZES[index])
                .map(|_| AtomicU32::new(EMPTY_SLOT))
                .collect()
        })
    }

    /// Allocated segments only; never allocates
    fn allocated_segments(&self) -> impl Iterator<Item = &[AtomicU32]> + '_ {
        self.segments
            .iter()
            .filter_map(|segment| segment.get().map(|slots| &slots[..]))
    }

    /// Attempts to add `client` as a holder.
    ///
    /// Fails if the lock is dead (no holders left, about to be removed from
    /// its map), carries the update flag, is at capacity, or if `client`
    /// already holds it.
    pub fn acquire(&self, client: ClientId) -> bool {
        if !self.acquire_reference() {
            return false;
        }

        if self.holds(client) {
            self.release_reference();
            return false;
        }

        if self.add_holder(client) {
            true
        } else {
            self.release_reference();
            false
        }
    }

    /// Removes `client` from the holders.
    /// Returns true if it was the last holder; the lock is then dead.
    pub fn release(&self, client: ClientId) -> bool {
        self.remove_holder(client);
        self.release_reference()
    }

    fn acquire_reference(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            // A set update flag makes `current` exceed MAX_HOLDERS
            if current == 0 || current >= MAX_HOLDERS {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_reference(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let count = current & Self::COUNT_MASK;
            debug_assert!(count > 0, "released a shared lock with no references");
            let new_count = count.saturating_sub(1);
            let new_value = new_count | (current & Self::UPDATE_LOCK_FLAG);

            match self.state.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new_count == 0,
                Err(actual) => current = actual,
            }
        }
    }

    fn add_holder(&self, client: ClientId) -> bool {
        let tag = slot_tag(client);
        for _ in 0..INSERT_PASSES {
            for index in 0..SEGMENT_SIZES.len() {
                let slots = self.segment(index);
                for slot in slots {
                    if slot.load(Ordering::Relaxed) == EMPTY_SLOT
                        && slot
                            .compare_exchange(EMPTY_SLOT, tag, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn remove_holder(&self, client: ClientId) {
        let tag = slot_tag(client);
        for slots in self.allocated_segments() {
            for slot in slots {
                if slot
                    .compare_exchange(tag, EMPTY_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }

    /// Sets the update flag, reserving the right to become the only holder.
    /// Fails if another client already holds the update flag or the lock is dead.
    pub fn try_acquire_update_lock(&self, client: ClientId) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == 0 || current & Self::UPDATE_LOCK_FLAG != 0 {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                current | Self::UPDATE_LOCK_FLAG,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.update_holder.store(slot_tag(client), Ordering::Release);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Clears the update flag, turning the lock back into a plain shared lock
    pub fn release_update_lock(&self) {
        self.clean_update_holder();
        self.state.fetch_and(Self::COUNT_MASK, Ordering::AcqRel);
    }

    pub fn clean_update_holder(&self) {
        self.update_holder.store(EMPTY_SLOT, Ordering::Release);
    }

    pub fn update_holder(&self) -> Option<ClientId> {
        slot_client(self.update_holder.load(Ordering::Acquire))
    }

    pub fn number_of_holders(&self) -> u32 {
        self.state.load(Ordering::Acquire) & Self::COUNT_MASK
    }

    pub fn is_update_lock(&self) -> bool {
        self.state.load(Ordering::Acquire) & Self::UPDATE_LOCK_FLAG != 0
    }

    /// True if the last holder has released it
    pub fn is_dead(&self) -> bool {
        self.number_of_holders() == 0
    }

    pub fn holds(&self, client: ClientId) -> bool {
        let tag = slot_tag(client);
        self.allocated_segments()
            .flat_map(|slots| slots.iter())
            .any(|slot| slot.load(Ordering::Acquire) == tag)
    }

    /// Visits the current holders. Concurrent changes may or may not be observed.
    pub fn for_each_holder(&self, mut f: impl FnMut(ClientId)) {
        for slots in self.allocated_segments() {
            for slot in slots {
                if let Some(client) = slot_client(slot.load(Ordering::Acquire)) {
                    f(client);
                }
            }
        }
    }
}

/// A lock installed in a resource slot
#[derive(Debug, Clone)]
pub enum Lock {
    Exclusive(Arc<ExclusiveLock>),
    Shared(Arc<SharedLock>),
}

impl Lock {
    pub fn mode(&self) -> LockMode {
        match self {
            Lock::Exclusive(_) => LockMode::Exclusive,
            Lock::Shared(_) => LockMode::Shared,
        }
    }

    /// Same lock object, not merely the same kind
    pub fn ptr_eq(&self, other: &Lock) -> bool {
        match (self, other) {
            (Lock::Exclusive(a), Lock::Exclusive(b)) => Arc::ptr_eq(a, b),
            (Lock::Shared(a), Lock::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address-based identity, stable for the lifetime of the lock object
    pub fn identity(&self) -> usize {
        match self {
            Lock::Exclusive(lock) => Arc::as_ptr(lock) as usize,
            Lock::Shared(lock) => Arc::as_ptr(lock) as usize,
        }
    }

    pub fn number_of_holders(&self) -> u32 {
        match self {
            Lock::Exclusive(_) => 1,
            Lock::Shared(lock) => lock.number_of_holders(),
        }
    }

    pub fn is_update_lock(&self) -> bool {
        match self {
            Lock::Exclusive(_) => false,
            Lock::Shared(lock) => lock.is_update_lock(),
        }
    }

    /// The holder upgrading this lock, if any
    pub fn update_holder(&self) -> Option<ClientId> {
        match self {
            Lock::Exclusive(_) => None,
            Lock::Shared(lock) => lock.update_holder(),
        }
    }

    fn for_each_owner(&self, mut f: impl FnMut(ClientId)) {
        match self {
            Lock::Exclusive(lock) => f(lock.owner()),
            Lock::Shared(lock) => lock.for_each_holder(f),
        }
    }

    /// Unions every holder's wait-list into `target`, skipping `waiter` itself
    pub fn copy_holder_wait_lists_into(
        &self,
        registry: &ClientRegistry,
        waiter: ClientId,
        target: &mut BitSet,
    ) {
        self.for_each_owner(|holder| {
            if holder == waiter {
                return;
            }
            if let Some(client) = registry.get(holder) {
                client.wait_list().copy_into(target);
            }
        });
    }

    /// Returns a holder whose wait-list already contains `waiter`, if any
    pub fn any_holder_is_waiting_for(&self, registry: &ClientRegistry, waiter: ClientId) -> Option<ClientId> {
        let mut candidate = None;
        self.for_each_owner(|holder| {
            if candidate.is_some() {
                return;
            }
            if let Some(client) = registry.get(holder)
                && client.is_waiting_for(waiter)
            {
                candidate = Some(holder);
            }
        });
        candidate
    }

    pub fn collect_owners(&self, owners: &mut AHashSet<ClientId>) {
        self.for_each_owner(|holder| {
            owners.insert(holder);
        });
    }

    pub fn describe_wait_list(&self, registry: &ClientRegistry) -> String {
        let mut description = match self {
            Lock::Exclusive(_) => String::from("ExclusiveLock["),
            Lock::Shared(_) => String::from("SharedLock["),
        };
        self.for_each_owner(|holder| {
            description.push('\n');
            match registry.get(holder) {
                Some(client) => description.push_str(&client.describe_wait_list()),
                None => description.push_str(&format!("Client[{}] (disposed)", holder)),
            }
        });
        description.push(']');
        description
    }
}
