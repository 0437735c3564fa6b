//! Lock manager statistics
//!
//! Plain atomic counters bumped on the acquisition paths, plus a serde-friendly
//! snapshot for diagnostics dumps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::common::{LockError, LockMode};

/// Counters shared by a lock manager and all of its clients
#[derive(Debug)]
pub struct LockStats {
    /// Shared locks installed or joined globally
    shared_acquired: AtomicU64,
    /// Exclusive locks installed globally, upgrades included
    exclusive_acquired: AtomicU64,
    /// Acquisitions satisfied from the client's local counts
    reentrant_acquired: AtomicU64,
    /// Acquisitions that had to wait at least once
    waits: AtomicU64,
    /// Shared to exclusive upgrades completed
    upgrades: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
    /// Waits cut short because the client was stopped
    stopped_waits: AtomicU64,
    /// Deadlock candidates rejected by the owner graph walk
    false_deadlock_candidates: AtomicU64,
    clients_created: AtomicU64,
    clients_reused: AtomicU64,
    clients_disposed: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of [`LockStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatsSnapshot {
    /// Seconds since the manager was created
    pub uptime_seconds: u64,
    pub shared_acquired: u64,
    pub exclusive_acquired: u64,
    pub reentrant_acquired: u64,
    pub waits: u64,
    pub upgrades: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
    pub stopped_waits: u64,
    pub false_deadlock_candidates: u64,
    pub clients_created: u64,
    pub clients_reused: u64,
    pub clients_disposed: u64,
}

impl LockStats {
    pub fn new() -> Self {
        Self {
            shared_acquired: AtomicU64::new(0),
            exclusive_acquired: AtomicU64::new(0),
            reentrant_acquired: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            stopped_waits: AtomicU64::new(0),
            false_deadlock_candidates: AtomicU64::new(0),
            clients_created: AtomicU64::new(0),
            clients_reused: AtomicU64::new(0),
            clients_disposed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a lock taken globally
    pub fn record_acquired(&self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared_acquired.fetch_add(1, Ordering::Relaxed),
            LockMode::Exclusive => self.exclusive_acquired.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_reentrant(&self) {
        self.reentrant_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_false_deadlock(&self) {
        self.false_deadlock_candidates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed wait by its error category
    pub fn record_error(&self, error: &LockError) {
        match error.category() {
            "deadlock" => {
                self.deadlocks.fetch_add(1, Ordering::Relaxed);
            }
            "timeout" => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            "stopped" => {
                self.stopped_waits.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_client_created(&self) {
        self.clients_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_reused(&self) {
        self.clients_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_disposed(&self) {
        self.clients_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            shared_acquired: self.shared_acquired.load(Ordering::Relaxed),
            exclusive_acquired: self.exclusive_acquired.load(Ordering::Relaxed),
            reentrant_acquired: self.reentrant_acquired.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stopped_waits: self.stopped_waits.load(Ordering::Relaxed),
            false_deadlock_candidates: self.false_deadlock_candidates.load(Ordering::Relaxed),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            clients_reused: self.clients_reused.load(Ordering::Relaxed),
            clients_disposed: self.clients_disposed.load(Ordering::Relaxed),
        }
    }
}

impl Default for LockStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared statistics handle
pub type SharedLockStats = Arc<LockStats>;
