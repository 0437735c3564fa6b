//! Concurrent resource -> lock map
//!
//! One `LockMap` exists per resource type. An entry exists exactly while at
//! least one client holds the resource. All mutation goes through atomic
//! insert-if-absent, replace-if-same and remove-if-same operations; values are
//! cloned out immediately so no shard guard outlives a single call.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::common::ResourceId;
use crate::lock::Lock;

pub struct LockMap {
    map: DashMap<ResourceId, Lock, ahash::RandomState>,
}

impl LockMap {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Current lock on the resource, if any
    pub fn get(&self, resource_id: ResourceId) -> Option<Lock> {
        self.map.get(&resource_id).map(|entry| entry.value().clone())
    }

    /// Install `lock` if the resource is free.
    /// Returns `None` on success, otherwise the lock already installed.
    pub fn insert_if_absent(&self, resource_id: ResourceId, lock: Lock) -> Option<Lock> {
        match self.map.entry(resource_id) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(lock);
                None
            }
        }
    }

    /// Swap `expected` for `replacement` if `expected` is still installed
    pub fn replace_if_same(&self, resource_id: ResourceId, expected: &Lock, replacement: Lock) -> bool {
        if let Some(mut entry) = self.map.get_mut(&resource_id)
            && entry.value().ptr_eq(expected)
        {
            *entry.value_mut() = replacement;
            return true;
        }
        false
    }

    /// Remove the entry if `expected` is still installed
    pub fn remove_if_same(&self, resource_id: ResourceId, expected: &Lock) -> bool {
        self.map
            .remove_if(&resource_id, |_, current| current.ptr_eq(expected))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<(ResourceId, Lock)> {
        self.map
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

impl Default for LockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{ExclusiveLock, SharedLock};
    use std::sync::Arc;

    #[test]
    fn test_insert_if_absent() {
        let map = LockMap::new();
        let mine = Lock::Exclusive(Arc::new(ExclusiveLock::new(1)));
        let theirs = Lock::Exclusive(Arc::new(ExclusiveLock::new(2)));

        assert!(map.insert_if_absent(10, mine.clone()).is_none());
        let existing = map.insert_if_absent(10, theirs).unwrap();
        assert!(existing.ptr_eq(&mine));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_if_same() {
        let map = LockMap::new();
        let mine = Lock::Exclusive(Arc::new(ExclusiveLock::new(1)));
        let stale = Lock::Shared(Arc::new(SharedLock::new(1)));
        map.insert_if_absent(5, mine.clone());

        assert!(!map.remove_if_same(5, &stale));
        assert!(map.get(5).is_some());
        assert!(map.remove_if_same(5, &mine));
        assert!(map.get(5).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_replace_if_same() {
        let map = LockMap::new();
        let exclusive = Lock::Exclusive(Arc::new(ExclusiveLock::new(1)));
        let shared = Lock::Shared(Arc::new(SharedLock::new(1)));
        map.insert_if_absent(3, exclusive.clone());

        assert!(!map.replace_if_same(3, &shared, exclusive.clone()));
        assert!(map.replace_if_same(3, &exclusive, shared.clone()));
        assert!(map.get(3).unwrap().ptr_eq(&shared));
        assert!(!map.replace_if_same(4, &shared, exclusive));

        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, 3);
    }
}
