//! Deadlock resolution and verification
//!
//! Cycle candidates come from wait-list propagation (see `wait_list`). This
//! module decides which side of a candidate cycle aborts and confirms the
//! cycle against the live owner graph before anyone is told to abort.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::common::ClientId;
use crate::lock::Lock;
use crate::pool::ClientRegistry;

/// The introspectable state a resolution strategy may look at
pub trait DeadlockParticipant {
    fn id(&self) -> ClientId;
    /// Number of locks currently held
    fn lock_count(&self) -> usize;
    /// Number of clients in the published wait-list
    fn wait_list_size(&self) -> usize;
}

/// Policy choosing which of two deadlocked clients aborts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadlockResolutionStrategy {
    /// The client holding fewer locks aborts
    #[default]
    AbortYoung,
    /// The client holding more locks aborts
    AbortOld,
    /// The client with the shorter wait-list aborts
    AbortShortWaitList,
    /// The client with the longer wait-list aborts
    AbortLongWaitList,
}

impl DeadlockResolutionStrategy {
    pub const ALL: [DeadlockResolutionStrategy; 4] = [
        DeadlockResolutionStrategy::AbortYoung,
        DeadlockResolutionStrategy::AbortOld,
        DeadlockResolutionStrategy::AbortShortWaitList,
        DeadlockResolutionStrategy::AbortLongWaitList,
    ];

    /// Should `asking` abort to break its cycle with `other`?
    ///
    /// Called independently by both sides; for the same observed state
    /// exactly one of `should_abort(a, b)` and `should_abort(b, a)` is true.
    /// A client compared with itself always aborts.
    pub fn should_abort<A, B>(&self, asking: &A, other: &B) -> bool
    where
        A: DeadlockParticipant + ?Sized,
        B: DeadlockParticipant + ?Sized,
    {
        if asking.id() == other.id() {
            return true;
        }

        let (ours, theirs) = match self {
            DeadlockResolutionStrategy::AbortYoung | DeadlockResolutionStrategy::AbortOld => {
                (asking.lock_count(), other.lock_count())
            }
            DeadlockResolutionStrategy::AbortShortWaitList
            | DeadlockResolutionStrategy::AbortLongWaitList => {
                (asking.wait_list_size(), other.wait_list_size())
            }
        };

        let smaller_aborts = matches!(
            self,
            DeadlockResolutionStrategy::AbortYoung | DeadlockResolutionStrategy::AbortShortWaitList
        );

        match ours.cmp(&theirs) {
            std::cmp::Ordering::Less => smaller_aborts,
            std::cmp::Ordering::Greater => !smaller_aborts,
            // Ties: the lower id aborts, the higher id under AbortOld
            std::cmp::Ordering::Equal => {
                if *self == DeadlockResolutionStrategy::AbortOld {
                    asking.id() > other.id()
                } else {
                    asking.id() < other.id()
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlockResolutionStrategy::AbortYoung => "abort_young",
            DeadlockResolutionStrategy::AbortOld => "abort_old",
            DeadlockResolutionStrategy::AbortShortWaitList => "abort_short_wait_list",
            DeadlockResolutionStrategy::AbortLongWaitList => "abort_long_wait_list",
        }
    }
}

/// Walks the owner graph from the lock `waiter` is blocked on.
///
/// Starting from the owners of `blocking` (other than `waiter`), repeatedly
/// follows each owner to the lock it is blocked on and collects that lock's
/// owners. Returns true if `waiter` shows up among those owners, false once
/// no unvisited lock is left to follow.
pub fn owner_graph_reaches(registry: &ClientRegistry, blocking: &Lock, waiter: ClientId) -> bool {
    let mut visited: AHashSet<usize> = AHashSet::new();
    let mut owners: AHashSet<ClientId> = AHashSet::new();
    blocking.collect_owners(&mut owners);
    owners.remove(&waiter);

    let mut frontier: Vec<Lock> = Vec::new();
    let mut next_owners: AHashSet<ClientId> = AHashSet::new();

    loop {
        frontier.clear();
        for owner in &owners {
            let Some(client) = registry.get(*owner) else {
                continue;
            };
            if let Some(lock) = client.waiting_for_lock()
                && visited.insert(lock.identity())
            {
                frontier.push(lock);
            }
        }

        if frontier.is_empty() {
            return false;
        }

        next_owners.clear();
        for lock in &frontier {
            lock.collect_owners(&mut next_owners);
        }

        if next_owners.contains(&waiter) {
            return true;
        }

        std::mem::swap(&mut owners, &mut next_owners);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    struct Snapshot {
        id: ClientId,
        locks: usize,
        waiting: usize,
    }

    impl DeadlockParticipant for Snapshot {
        fn id(&self) -> ClientId {
            self.id
        }

        fn lock_count(&self) -> usize {
            self.locks
        }

        fn wait_list_size(&self) -> usize {
            self.waiting
        }
    }

    fn snapshot(id: ClientId, locks: usize, waiting: usize) -> Snapshot {
        Snapshot { id, locks, waiting }
    }

    #[test]
    fn test_abort_young() {
        let strategy = DeadlockResolutionStrategy::AbortYoung;
        let young = snapshot(1, 2, 5);
        let old = snapshot(2, 10, 1);
        assert!(strategy.should_abort(&young, &old));
        assert!(!strategy.should_abort(&old, &young));

        // tie on lock count: lower id aborts
        let a = snapshot(3, 4, 0);
        let b = snapshot(8, 4, 0);
        assert!(strategy.should_abort(&a, &b));
        assert!(!strategy.should_abort(&b, &a));
    }

    #[test]
    fn test_abort_old() {
        let strategy = DeadlockResolutionStrategy::AbortOld;
        let young = snapshot(1, 2, 5);
        let old = snapshot(2, 10, 1);
        assert!(!strategy.should_abort(&young, &old));
        assert!(strategy.should_abort(&old, &young));
    }

    #[test]
    fn test_wait_list_strategies() {
        let short = snapshot(1, 7, 2);
        let long = snapshot(2, 1, 9);
        assert!(DeadlockResolutionStrategy::AbortShortWaitList.should_abort(&short, &long));
        assert!(!DeadlockResolutionStrategy::AbortShortWaitList.should_abort(&long, &short));
        assert!(DeadlockResolutionStrategy::AbortLongWaitList.should_abort(&long, &short));
        assert!(!DeadlockResolutionStrategy::AbortLongWaitList.should_abort(&short, &long));
    }

    #[test]
    fn test_default_and_names() {
        assert_eq!(DeadlockResolutionStrategy::default(), DeadlockResolutionStrategy::AbortYoung);
        assert_eq!(DeadlockResolutionStrategy::AbortLongWaitList.as_str(), "abort_long_wait_list");
    }

    proptest! {
        #[test]
        fn exactly_one_side_aborts(
            a_id in 0u32..2048,
            b_id in 0u32..2048,
            a_locks in 0usize..16,
            b_locks in 0usize..16,
            a_waiting in 0usize..16,
            b_waiting in 0usize..16,
        ) {
            prop_assume!(a_id != b_id);
            let a = snapshot(a_id, a_locks, a_waiting);
            let b = snapshot(b_id, b_locks, b_waiting);
            for strategy in DeadlockResolutionStrategy::ALL {
                prop_assert!(strategy.should_abort(&a, &b) ^ strategy.should_abort(&b, &a));
            }
        }

        #[test]
        fn self_always_aborts(id in 0u32..2048, locks in 0usize..16, waiting in 0usize..16) {
            let me = snapshot(id, locks, waiting);
            for strategy in DeadlockResolutionStrategy::ALL {
                prop_assert!(strategy.should_abort(&me, &me));
            }
        }
    }
}
