//! Common types and error definitions for rslock
//!
//! This module contains the identifier types, the error taxonomy and the
//! configuration consumed by the lock manager and its clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deadlock::DeadlockResolutionStrategy;

/// Small, pooled identifier of a client. Used to index wait-list bitsets.
pub type ClientId = u32;

/// Identifier of a resource within its resource type.
pub type ResourceId = u64;

/// Lock modes supported by the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for lock manager operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// A live wait cycle was confirmed and this client was chosen to abort
    #[error("{message}")]
    Deadlock { client_id: ClientId, message: String },

    #[error(
        "Client[{client_id}] timed out after {waited_ms} ms waiting for {mode} lock on {resource_type}({resource_id})"
    )]
    AcquisitionTimeout {
        client_id: ClientId,
        resource_type: String,
        resource_id: ResourceId,
        mode: LockMode,
        waited_ms: u64,
    },

    #[error("Client[{client_id}] has been stopped")]
    ClientStopped { client_id: ClientId },

    #[error("Client[{client_id}] is preparing and cannot acquire new locks")]
    ClientPreparing { client_id: ClientId },

    /// Release of a lock the client does not hold locally
    #[error("Client[{client_id}] holds no {mode} lock on {resource_type}({resource_id})")]
    NotHeld {
        client_id: ClientId,
        resource_type: String,
        resource_id: ResourceId,
        mode: LockMode,
    },

    #[error("Client[{client_id}] overflowed the {mode} reference count on {resource_type}({resource_id})")]
    ReferenceCountOverflow {
        client_id: ClientId,
        resource_type: String,
        resource_id: ResourceId,
        mode: LockMode,
    },

    #[error("Lock manager has been closed")]
    ManagerClosed,

    #[error("Resource type {name} (id {id}) is not registered with this lock manager")]
    UnknownResourceType { id: u32, name: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl LockError {
    /// Check if the transaction that received this error may retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LockError::Deadlock { .. }
                | LockError::AcquisitionTimeout { .. }
                | LockError::ClientStopped { .. }
        )
    }

    /// Check if this error is a programming error on the caller's side
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            LockError::NotHeld { .. }
                | LockError::ReferenceCountOverflow { .. }
                | LockError::ManagerClosed
                | LockError::UnknownResourceType { .. }
                | LockError::ClientPreparing { .. }
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            LockError::Deadlock { .. } => "deadlock",
            LockError::AcquisitionTimeout { .. } => "timeout",
            LockError::ClientStopped { .. } => "stopped",
            LockError::ClientPreparing { .. } => "preparing",
            LockError::NotHeld { .. } | LockError::ReferenceCountOverflow { .. } => "misuse",
            LockError::ManagerClosed => "closed",
            LockError::UnknownResourceType { .. } => "resource_type",
            LockError::InvalidConfig { .. } => "configuration",
        }
    }
}

/// Result type alias for lock manager operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Configuration for a lock manager instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Maximum time a single acquisition may wait, in milliseconds. 0 waits forever.
    pub lock_acquisition_timeout_ms: u64,
    /// Policy choosing which of two deadlocked clients aborts
    pub deadlock_resolution: DeadlockResolutionStrategy,
    /// Include every holder's wait-list in deadlock messages
    pub verbose_deadlocks: bool,
    /// Wait iterations on a shared lock before an exclusive request tries to upgrade it
    pub upgrade_grace_tries: u32,
    /// Below this many wait iterations, finding ourselves in the owner graph is only suspicious
    pub deadlock_verification_tries: u32,
    /// Pause before re-walking the owner graph after a suspicious sighting, in microseconds
    pub deadlock_verification_pause_us: u64,
    /// Number of idle clients kept by the pool
    pub max_idle_clients: usize,
    /// Disposed clients with an id below this limit give their id back for reuse
    pub recycled_client_id_limit: u32,
    /// Local lock maps larger than this are reallocated rather than cleared on bulk release
    pub local_map_retain_capacity: usize,
}

impl Config {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.recycled_client_id_limit == 0 {
            return Err(LockError::InvalidConfig {
                message: "Recycled client id limit must be at least 1".to_string(),
            });
        }

        if self.recycled_client_id_limit > 65536 {
            return Err(LockError::InvalidConfig {
                message: "Recycled client id limit cannot exceed 65536".to_string(),
            });
        }

        if self.deadlock_verification_pause_us > 1_000_000 {
            return Err(LockError::InvalidConfig {
                message: "Deadlock verification pause cannot exceed one second".to_string(),
            });
        }

        if self.max_idle_clients > 65536 {
            return Err(LockError::InvalidConfig {
                message: "Maximum idle clients cannot exceed 65536".to_string(),
            });
        }

        if self.upgrade_grace_tries > 1_000_000 {
            return Err(LockError::InvalidConfig {
                message: "Upgrade grace tries cannot exceed 1000000".to_string(),
            });
        }

        if self.lock_acquisition_timeout_ms != 0 && self.lock_acquisition_timeout_ms < 10 {
            log::warn!(
                "Lock acquisition timeout of {} ms is very short, expect spurious timeouts under contention",
                self.lock_acquisition_timeout_ms
            );
        }

        Ok(())
    }

    /// Create a configuration with the given acquisition timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let config = Self {
            lock_acquisition_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// The acquisition timeout, if one is configured
    pub fn lock_acquisition_timeout(&self) -> Option<Duration> {
        match self.lock_acquisition_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn deadlock_verification_pause(&self) -> Duration {
        Duration::from_micros(self.deadlock_verification_pause_us)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_acquisition_timeout_ms: 0,
            deadlock_resolution: DeadlockResolutionStrategy::AbortYoung,
            verbose_deadlocks: false,
            upgrade_grace_tries: 50,
            deadlock_verification_tries: 20,
            deadlock_verification_pause_us: 500,
            max_idle_clients: 64,
            recycled_client_id_limit: 1024,
            local_map_retain_capacity: 32,
        }
    }
}
