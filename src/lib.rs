//! # rslock: An In-Process Lock Manager with Deadlock Detection
//!
//! `rslock` grants shared and exclusive locks on abstract resources, identified
//! by a resource type and a numeric id, to concurrent transaction clients. It
//! detects deadlocks without a central wait-for graph: every client publishes
//! the set of clients it is waiting behind ("dreadlocks"), and a suspected
//! cycle is confirmed by walking the live owner graph before anyone aborts.
//!
//! ## Core Features
//!
//! - **Reentrant Locks**: Repeated acquisitions are served from client-local counts
//! - **Lock Upgrades**: A shared holder can become the exclusive holder once others drain
//! - **Pluggable Deadlock Resolution**: Choose which side of a cycle aborts
//! - **Client Pooling**: Small, recycled client ids keep wait-lists compact
//!
//! ## Example
//!
//! ```rust
//! use rslock::{Config, LockManager, ResourceType};
//!
//! fn main() -> rslock::Result<()> {
//!     let node = ResourceType::new(0, "Node");
//!     let manager = LockManager::new(Config::default(), vec![node.clone()])?;
//!
//!     let client = manager.new_client()?;
//!     client.acquire_exclusive(&node, &[42])?;
//!     client.release_exclusive(&node, &[42])?;
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod common;
pub mod deadlock;
pub mod lock;
pub mod lock_map;
pub mod manager;
pub mod pool;
pub mod resource;
pub mod stats;
pub mod wait_list;


// Re-export commonly used types
pub use common::{ClientId, Config, LockError, LockMode, ResourceId, Result};
pub use resource::{IncrementalBackoff, ResourceType, SpinWait, WaitStrategy};

// Re-export main types
pub use client::{ActiveLock, Client};
pub use deadlock::{DeadlockParticipant, DeadlockResolutionStrategy};
pub use lock::MAX_HOLDERS;
pub use manager::{LockInfo, LockManager};
pub use stats::{LockStats, LockStatsSnapshot};
