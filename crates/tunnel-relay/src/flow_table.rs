//! Bounded, access-ordered flow cache.
//!
//! One mutex guards the whole table: lookups reorder the LRU list and insertions may evict, so
//! there is no useful per-entry granularity. Entries are `Arc`s so the reactors can keep working
//! on a flow after releasing the table lock. Lock order is table, then entry; callers must not
//! call into the table while holding an entry's own lock.

use std::fmt::Display;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 50;

/// Something stored in a [`FlowTable`] that owns an OS resource.
pub trait FlowEntry: Send + Sync {
    /// Releases the entry's socket and stops its tasks. Must be idempotent.
    fn close(&self);

    /// Called just before `close` when the entry is pushed out by capacity pressure.
    fn mark_evicted(&self) {}
}

pub struct FlowTable<K, V> {
    inner: Mutex<LruCache<K, Arc<V>>>,
}

impl<K, V> FlowTable<K, V>
where
    K: Hash + Eq + Clone + Display,
    V: FlowEntry,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Arc<V>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Looks up a flow and marks it most recently used.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.lock().get(key).cloned()
    }

    /// Looks up a flow without touching its recency.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// Inserts a flow as most recently used.
    ///
    /// If the table is full, the least recently used flow is removed, marked evicted and closed
    /// before the new one is admitted; it is returned so the caller can account for it. A previous
    /// entry under the same key is closed and replaced.
    pub fn put(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let mut inner = self.lock();
        match inner.push(key.clone(), Arc::clone(&value)) {
            Some((old_key, old)) if old_key != key => {
                tracing::warn!(flow = %old_key, "closing evicted flow");
                old.mark_evicted();
                old.close();
                Some(old)
            }
            Some((_, old)) => {
                if !Arc::ptr_eq(&old, &value) {
                    old.close();
                }
                None
            }
            None => None,
        }
    }

    /// Removes the flow under `key`, if any, and closes it.
    pub fn remove_and_close(&self, key: &K) -> Option<Arc<V>> {
        let removed = self.lock().pop(key);
        if let Some(entry) = &removed {
            entry.close();
        }
        removed
    }

    /// Closes `entry` and removes it from the table if it is still the one stored under `key`.
    ///
    /// Reactors tear flows down through this so a late teardown cannot remove a newer flow that
    /// reused the same key. Returns whether the table entry was removed.
    pub fn remove_entry_and_close(&self, key: &K, entry: &Arc<V>) -> bool {
        let removed = {
            let mut inner = self.lock();
            let same = inner.peek(key).is_some_and(|current| Arc::ptr_eq(current, entry));
            if same {
                inner.pop(key);
            }
            same
        };
        entry.close();
        removed
    }

    /// Drains the table, closing every flow. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        let mut closed = 0;
        while let Some((_, entry)) = inner.pop_lru() {
            entry.close();
            closed += 1;
        }
        closed
    }

    /// Current entries, most recently used first.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeFlow {
        closes: AtomicUsize,
        evicted: AtomicBool,
    }

    impl FlowEntry for FakeFlow {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn mark_evicted(&self) {
            self.evicted.store(true, Ordering::SeqCst);
        }
    }

    fn table(cap: usize) -> FlowTable<u16, FakeFlow> {
        FlowTable::new(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn fifty_first_flow_evicts_least_recently_used() {
        let table = table(DEFAULT_CAPACITY);
        let flows: Vec<_> = (0..50u16).map(|_| Arc::new(FakeFlow::default())).collect();
        for (port, flow) in flows.iter().enumerate() {
            assert!(table.put(port as u16, Arc::clone(flow)).is_none());
        }
        assert_eq!(table.len(), 50);

        let evicted = table.put(50, Arc::new(FakeFlow::default())).unwrap();
        assert!(Arc::ptr_eq(&evicted, &flows[0]));
        assert_eq!(flows[0].closes.load(Ordering::SeqCst), 1);
        assert!(flows[0].evicted.load(Ordering::SeqCst));
        assert_eq!(table.len(), 50);
        assert!(!table.contains(&0));
        for flow in &flows[1..] {
            assert_eq!(flow.closes.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn get_refreshes_recency_but_peek_does_not() {
        let table = table(2);
        let a = Arc::new(FakeFlow::default());
        let b = Arc::new(FakeFlow::default());
        table.put(1, Arc::clone(&a));
        table.put(2, Arc::clone(&b));

        assert!(table.peek(&1).is_some());
        assert!(table.get(&1).is_some());
        let evicted = table.put(3, Arc::new(FakeFlow::default())).unwrap();
        assert!(Arc::ptr_eq(&evicted, &b));
        assert_eq!(a.closes.load(Ordering::SeqCst), 0);
        assert!(table.contains(&1));
    }

    #[test]
    fn replacing_a_key_closes_the_old_entry() {
        let table = table(4);
        let old = Arc::new(FakeFlow::default());
        table.put(7, Arc::clone(&old));
        assert!(table.put(7, Arc::new(FakeFlow::default())).is_none());
        assert_eq!(old.closes.load(Ordering::SeqCst), 1);
        assert!(!old.evicted.load(Ordering::SeqCst));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_teardown_leaves_newer_flow_in_place() {
        let table = table(4);
        let stale = Arc::new(FakeFlow::default());
        let fresh = Arc::new(FakeFlow::default());
        table.put(9, Arc::clone(&fresh));

        assert!(!table.remove_entry_and_close(&9, &stale));
        assert_eq!(stale.closes.load(Ordering::SeqCst), 1);
        assert!(table.contains(&9));

        assert!(table.remove_entry_and_close(&9, &fresh));
        assert!(table.is_empty());
    }

    #[test]
    fn remove_and_close_all_close_sockets() {
        let table = table(4);
        let flows: Vec<_> = (0..3u16).map(|_| Arc::new(FakeFlow::default())).collect();
        for (port, flow) in flows.iter().enumerate() {
            table.put(port as u16, Arc::clone(flow));
        }

        assert!(table.remove_and_close(&1).is_some());
        assert!(table.remove_and_close(&1).is_none());
        assert_eq!(flows[1].closes.load(Ordering::SeqCst), 1);

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
        for flow in &flows {
            assert_eq!(flow.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn snapshot_lists_most_recent_first() {
        let table = table(4);
        for port in 0..3u16 {
            table.put(port, Arc::new(FakeFlow::default()));
        }
        table.get(&0);
        let keys: Vec<u16> = table.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![0, 2, 1]);
    }
}
