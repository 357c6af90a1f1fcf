#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use rustc_hash::FxHashMap;

mod scheduler;

pub use scheduler::{default_parallelism, TaskHandle, TaskScheduler};

type Registry = Arc<Mutex<FxHashMap<String, Arc<Mutex<()>>>>>;

/// Registry of per-node exclusive locks.
///
/// Locks are created on first use and dropped from the registry once the
/// last guard or waiter lets go of them.
#[derive(Default)]
pub struct LockManager {
    registry: Registry,
}

/// Guard holding one node's lock; releases it on drop.
pub struct NodeLockGuard {
    registry: Registry,
    node: String,
    lock: Arc<Mutex<()>>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl NodeLockGuard {
    /// Node this guard locks.
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut registry = self.registry.lock();
        // Registry entry plus ours: nobody else is waiting on it.
        if Arc::strong_count(&self.lock) == 2 {
            if let Some(existing) = registry.get(&self.node) {
                if Arc::ptr_eq(existing, &self.lock) {
                    registry.remove(&self.node);
                }
            }
        }
    }
}

impl LockManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock for `node` is held.
    pub fn acquire(&self, node: &str) -> NodeLockGuard {
        let lock = {
            let mut registry = self.registry.lock();
            Arc::clone(
                registry
                    .entry(node.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = lock.lock_arc();
        NodeLockGuard {
            registry: Arc::clone(&self.registry),
            node: node.to_owned(),
            lock,
            guard: Some(guard),
        }
    }

    /// Locks every node in `nodes`, in sorted order and without duplicates.
    pub fn acquire_many<'a, I>(&self, nodes: I) -> Vec<NodeLockGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut nodes: Vec<&str> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter().map(|node| self.acquire(node)).collect()
    }

    /// Attempts to lock `node` without blocking.
    pub fn try_acquire(&self, node: &str) -> Option<NodeLockGuard> {
        let lock = {
            let mut registry = self.registry.lock();
            Arc::clone(
                registry
                    .entry(node.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = lock.try_lock_arc()?;
        Some(NodeLockGuard {
            registry: Arc::clone(&self.registry),
            node: node.to_owned(),
            lock,
            guard: Some(guard),
        })
    }

    /// Forgets every registered lock. Outstanding guards stay valid but
    /// later acquirers start from fresh locks.
    pub fn release_all(&self) {
        self.registry.lock().clear();
    }

    /// Number of registered locks.
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_is_exclusive_per_node() {
        let locks = Arc::new(LockManager::new());
        let guard = locks.acquire("a");
        assert!(locks.try_acquire("a").is_none());
        let other = locks.try_acquire("b").expect("independent node");
        drop(other);
        drop(guard);
        assert!(locks.try_acquire("a").is_some());
    }

    #[test]
    fn registry_shrinks_after_release() {
        let locks = LockManager::new();
        let guards = locks.acquire_many(["b", "a", "b", "c"]);
        assert_eq!(guards.len(), 3);
        assert_eq!(guards[0].node(), "a");
        assert_eq!(locks.registered(), 3);
        drop(guards);
        assert_eq!(locks.registered(), 0);
    }

    #[test]
    fn contended_lock_serializes_critical_sections() {
        let locks = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.acquire("hot");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_micros(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.registered(), 0);
    }
}
