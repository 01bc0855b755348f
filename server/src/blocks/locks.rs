//! Per-block-id mutual exclusion.
//!
//! Intake, promotion, expulsion and reaping of the same id run one at a time.
//! Different ids never contend. Request handlers and the reaper share the registry
//! but hold no lock across ids.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct BlockLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BlockLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `block_id`.
    ///
    /// Blocks the calling thread while another operation on the same id is in
    /// flight, so call it from a blocking context.
    pub fn with_lock<R>(&self, block_id: &str, f: impl FnOnce() -> R) -> R {
        let lock = self
            .locks
            .entry(block_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            // The guarded value is `()`, a poisoned lock carries no broken state.
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };

        drop(lock);
        self.locks
            .remove_if(block_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of ids with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_id_is_serialized() {
        let locks = Arc::new(BlockLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    locks.with_lock("b1", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_entries_are_released_after_use() {
        let locks = BlockLocks::new();
        let value = locks.with_lock("b1", || locks.len());
        assert_eq!(value, 1);
        assert_eq!(locks.len(), 0);
    }
}
