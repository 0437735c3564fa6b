//! Resource types and wait strategies
//!
//! A resource is the pair (resource type, resource id). The resource type is an
//! immutable descriptor supplied by the surrounding engine: a dense integer id
//! used to index the per-type lock maps, a name for diagnostics, and the
//! strategy a client uses to back off while it waits on that type.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How a client burns time between two attempts at a contended lock.
///
/// `iteration` is the number of failed attempts so far for the current
/// acquisition, starting at 0.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    fn apply(&self, iteration: u32);
}

/// Busy-spins on every iteration. Only sensible for very short critical sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinWait;

impl WaitStrategy for SpinWait {
    #[inline]
    fn apply(&self, _iteration: u32) {
        std::hint::spin_loop();
    }
}

/// Spin first, then yield, then sleep with an exponentially growing delay.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalBackoff {
    /// Iterations spent busy-spinning
    pub spin_iterations: u32,
    /// Iterations after spinning spent yielding the time slice
    pub yield_iterations: u32,
    /// Upper bound of a single sleep
    pub max_sleep: Duration,
}

impl IncrementalBackoff {
    pub fn new(spin_iterations: u32, yield_iterations: u32, max_sleep: Duration) -> Self {
        Self {
            spin_iterations,
            yield_iterations,
            max_sleep,
        }
    }

    /// Delay applied at the given iteration once spinning and yielding are exhausted
    pub fn sleep_for(&self, iteration: u32) -> Duration {
        let sleeping = iteration.saturating_sub(self.spin_iterations + self.yield_iterations);
        let micros = 1u64 << sleeping.min(20);
        Duration::from_micros(micros).min(self.max_sleep)
    }
}

impl Default for IncrementalBackoff {
    fn default() -> Self {
        Self::new(64, 64, Duration::from_millis(1))
    }
}

impl WaitStrategy for IncrementalBackoff {
    fn apply(&self, iteration: u32) {
        if iteration < self.spin_iterations {
            std::hint::spin_loop();
        } else if iteration < self.spin_iterations + self.yield_iterations {
            thread::yield_now();
        } else {
            thread::sleep(self.sleep_for(iteration));
        }
    }
}

/// Descriptor of a family of lockable resources
#[derive(Clone)]
pub struct ResourceType {
    id: u32,
    name: Arc<str>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl ResourceType {
    /// Create a resource type using the default incremental backoff
    pub fn new(id: u32, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
            wait_strategy: Arc::new(IncrementalBackoff::default()),
        }
    }

    pub fn with_wait_strategy(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait_strategy = Arc::new(strategy);
        self
    }

    /// Dense id, used as an index into per-type tables
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_strategy(&self) -> &dyn WaitStrategy {
        self.wait_strategy.as_ref()
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("wait_strategy", &self.wait_strategy)
            .finish()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl Eq for ResourceType {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct CountingWait {
        calls: AtomicU32,
    }

    impl WaitStrategy for CountingWait {
        fn apply(&self, _iteration: u32) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_resource_type_accessors() {
        let node = ResourceType::new(0, "Node");
        assert_eq!(node.id(), 0);
        assert_eq!(node.name(), "Node");
        assert_eq!(node.to_string(), "Node");
        assert_eq!(node, ResourceType::new(0, "Node"));
        assert_ne!(node, ResourceType::new(1, "Node"));
    }

    #[test]
    fn test_custom_wait_strategy() {
        let rel = ResourceType::new(1, "Relationship").with_wait_strategy(CountingWait::default());
        rel.wait_strategy().apply(0);
        rel.wait_strategy().apply(1);
        assert!(format!("{:?}", rel).contains("calls: 2"));
    }

    #[test]
    fn test_spin_wait_never_sleeps() {
        let node = ResourceType::new(0, "Node").with_wait_strategy(SpinWait);
        let start = std::time::Instant::now();
        for iteration in 0..10_000 {
            node.wait_strategy().apply(iteration);
        }
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(format!("{:?}", node).contains("SpinWait"));
    }

    #[test]
    fn test_backoff_sleep_is_capped() {
        let backoff = IncrementalBackoff::new(2, 2, Duration::from_micros(100));
        assert_eq!(backoff.sleep_for(4), Duration::from_micros(1));
        assert_eq!(backoff.sleep_for(5), Duration::from_micros(2));
        assert_eq!(backoff.sleep_for(10), Duration::from_micros(64));
        assert_eq!(backoff.sleep_for(500), Duration::from_micros(100));
    }

    #[test]
    fn test_backoff_apply_does_not_block_for_long() {
        let backoff = IncrementalBackoff::default();
        let start = std::time::Instant::now();
        for iteration in 0..140 {
            backoff.apply(iteration);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
