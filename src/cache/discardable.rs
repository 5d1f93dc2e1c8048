//! Coarsely locked two-generation cache.
//!
//! Used for compute pipelines, where lookups are rare enough that a single
//! read/write lock over both generations is acceptable.
//!
//! # Retry contract
//!
//! There is no atomic "find or insert". Callers follow this loop:
//!
//! ```rust,ignore
//! loop {
//!     let mut guard = match cache.find_or_lock(&key) {
//!         Lookup::Found(value) => break value,
//!         Lookup::Vacant(guard) => guard,
//!     };
//!     let value = create();
//!     if guard.add(key.clone(), value.clone()) {
//!         break value;
//!     }
//!     // Another writer inserted the key first: look it up again.
//! }
//! ```
//!
//! [`find_or_lock`](DiscardableKeyValueCache::find_or_lock) keeps the write
//! lock when it misses, so the `add` in the same scope cannot lose that race.
//! An `add` issued through [`lock_write`](DiscardableKeyValueCache::lock_write)
//! without a preceding lookup can, and reports it by returning `false`.
//!
//! # Aging
//!
//! Keys added to or promoted into current since the last
//! [`end_frame`](DiscardableKeyValueCache::end_frame) are fresh. The
//! per-frame [`discard_and_swap`](CacheWriteGuard::discard_and_swap) keeps
//! them current, so an untouched entry survives two eviction cycles.
//! [`discard`](CacheWriteGuard::discard) ignores freshness.

use std::hash::Hash;

use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHashSet};

use super::CacheValue;

struct Generations<K, V> {
    current: FxHashMap<K, V>,
    backfill: FxHashMap<K, V>,
    /// Keys that entered current this frame.
    fresh: FxHashSet<K>,
}

impl<K: Eq + Hash + Clone, V: CacheValue> Generations<K, V> {
    /// Moves `key` from backfill into current, returning the value.
    fn promote(&mut self, key: &K) -> Option<V> {
        let (key, value) = self.backfill.remove_entry(key)?;
        self.fresh.insert(key.clone());
        self.current.insert(key, value.clone());
        Some(value)
    }

    fn swap(&mut self, mut on_evict: impl FnMut(K, V), keep: &FxHashSet<K>) -> usize {
        let evicted = self.backfill.len();
        for (key, value) in self.backfill.drain() {
            on_evict(key, value);
        }
        std::mem::swap(&mut self.current, &mut self.backfill);
        for key in keep {
            if let Some((key, value)) = self.backfill.remove_entry(key) {
                self.current.insert(key, value);
            }
        }
        evicted
    }
}

/// Result of [`DiscardableKeyValueCache::find_or_lock`].
pub enum Lookup<'a, K, V> {
    Found(V),
    /// The key is absent; the write lock is still held.
    Vacant(CacheWriteGuard<'a, K, V>),
}

/// Two-generation map behind a single read/write lock.
pub struct DiscardableKeyValueCache<K, V> {
    maps: RwLock<Generations<K, V>>,
}

impl<K: Eq + Hash + Clone, V: CacheValue> Default for DiscardableKeyValueCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: CacheValue> DiscardableKeyValueCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Generations {
                current: FxHashMap::default(),
                backfill: FxHashMap::default(),
                fresh: FxHashSet::default(),
            }),
        }
    }

    /// Looks `key` up in current, then backfill. A backfill hit is promoted
    /// into current.
    pub fn find(&self, key: &K) -> Option<V> {
        {
            let maps = self.maps.read();
            if let Some(value) = maps.current.get(key) {
                return Some(value.clone());
            }
            if !maps.backfill.contains_key(key) {
                return None;
            }
        }

        // Another thread may have promoted or discarded it between the locks.
        let mut maps = self.maps.write();
        if let Some(value) = maps.current.get(key) {
            return Some(value.clone());
        }
        maps.promote(key)
    }

    /// Like [`find`](Self::find), but a miss returns the write lock so the
    /// caller can insert without another thread slipping in between.
    pub fn find_or_lock(&self, key: &K) -> Lookup<'_, K, V> {
        if let Some(value) = self.maps.read().current.get(key) {
            return Lookup::Found(value.clone());
        }

        let mut guard = self.lock_write();
        match guard.find(key) {
            Some(value) => Lookup::Found(value),
            None => Lookup::Vacant(guard),
        }
    }

    /// Acquires the write lock for a batch of operations.
    pub fn lock_write(&self) -> CacheWriteGuard<'_, K, V> {
        CacheWriteGuard {
            maps: self.maps.write(),
        }
    }

    /// Evicts everything left in backfill and swaps the generations.
    ///
    /// `on_evict` runs once per evicted entry. Returns the number evicted.
    pub fn discard(&self, on_evict: impl FnMut(K, V)) -> usize {
        self.lock_write().discard(on_evict)
    }

    /// Like [`discard`](Self::discard), but entries that entered current
    /// this frame stay there. Ends the frame.
    pub fn discard_and_swap(&self, on_evict: impl FnMut(K, V)) -> usize {
        self.lock_write().discard_and_swap(on_evict)
    }

    /// Closes the frame: every current entry starts aging.
    pub fn end_frame(&self) {
        self.maps.write().fresh.clear();
    }

    /// Non-promoting lookup in either generation.
    pub fn peek(&self, key: &K) -> Option<V> {
        let maps = self.maps.read();
        maps.current
            .get(key)
            .or_else(|| maps.backfill.get(key))
            .cloned()
    }

    #[must_use]
    pub fn current_len(&self) -> usize {
        self.maps.read().current.len()
    }

    #[must_use]
    pub fn backfill_len(&self) -> usize {
        self.maps.read().backfill.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let maps = self.maps.read();
        maps.current.len() + maps.backfill.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to both generations.
pub struct CacheWriteGuard<'a, K, V> {
    maps: RwLockWriteGuard<'a, Generations<K, V>>,
}

impl<K: Eq + Hash + Clone, V: CacheValue> CacheWriteGuard<'_, K, V> {
    /// Lookup with promotion, under the already held lock.
    pub fn find(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.maps.current.get(key) {
            return Some(value.clone());
        }
        self.maps.promote(key)
    }

    /// Inserts into current. Returns `false` if the key is already there,
    /// in which case the caller must go back to `find`.
    pub fn add(&mut self, key: K, value: V) -> bool {
        if self.maps.current.contains_key(&key) {
            return false;
        }
        self.maps.fresh.insert(key.clone());
        self.maps.current.insert(key, value);
        true
    }

    /// Removes `key` only if `predicate` accepts the value stored for it.
    pub fn remove_if(&mut self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let maps = &mut *self.maps;
        let generation = if maps.current.contains_key(key) {
            &mut maps.current
        } else {
            &mut maps.backfill
        };
        if generation.get(key).is_some_and(predicate) {
            generation.remove(key)
        } else {
            None
        }
    }

    /// Evicts everything left in backfill and swaps the generations.
    pub fn discard(&mut self, on_evict: impl FnMut(K, V)) -> usize {
        self.maps.fresh.clear();
        self.maps.swap(on_evict, &FxHashSet::default())
    }

    /// Evicts backfill and swaps, keeping this frame's fresh keys current.
    pub fn discard_and_swap(&mut self, on_evict: impl FnMut(K, V)) -> usize {
        let fresh = std::mem::take(&mut self.maps.fresh);
        self.maps.swap(on_evict, &fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::pipeline::state::TrackedEntry;

    #[derive(Debug)]
    struct Entry(&'static str);

    impl TrackedEntry for Entry {}

    type Cache = DiscardableKeyValueCache<u32, Arc<Entry>>;

    #[test]
    fn find_on_empty_cache_has_no_side_effects() {
        let cache = Cache::new();
        assert!(cache.find(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn add_fails_when_key_already_current() {
        let cache = Cache::new();
        assert!(cache.lock_write().add(1, Arc::new(Entry("a"))));
        assert!(!cache.lock_write().add(1, Arc::new(Entry("b"))));
        assert_eq!(cache.find(&1).unwrap().0, "a");
    }

    #[test]
    fn backfill_hit_is_promoted_and_survives_discard() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));
        cache.lock_write().add(2, Arc::new(Entry("b")));

        assert_eq!(cache.discard(|_, _| {}), 0);
        assert_eq!(cache.backfill_len(), 2);

        // Touch key 1 only.
        assert!(cache.find(&1).is_some());
        assert_eq!(cache.current_len(), 1);

        let mut evicted = Vec::new();
        assert_eq!(cache.discard(|k, _| evicted.push(k)), 1);
        assert_eq!(evicted, vec![2]);
        assert!(cache.peek(&1).is_some());
        assert!(cache.peek(&2).is_none());
    }

    #[test]
    fn untouched_entry_dies_on_second_discard() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));
        cache.discard(|_, _| {});
        assert!(cache.peek(&1).is_some());
        cache.discard(|_, _| {});
        assert!(cache.peek(&1).is_none());
    }

    #[test]
    fn fresh_entries_survive_the_frame_swap() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));

        assert_eq!(cache.discard_and_swap(|_, _| {}), 0);
        assert_eq!(cache.current_len(), 1);

        assert_eq!(cache.discard_and_swap(|_, _| {}), 0);
        assert_eq!(cache.backfill_len(), 1);

        let mut evicted = Vec::new();
        assert_eq!(cache.discard_and_swap(|k, _| evicted.push(k)), 1);
        assert_eq!(evicted, vec![1]);
        assert!(cache.is_empty());
    }

    #[test]
    fn end_frame_starts_aging() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));
        cache.end_frame();

        cache.discard_and_swap(|_, _| {});
        assert_eq!(cache.backfill_len(), 1);
    }

    #[test]
    fn promoted_entry_is_fresh_again() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));
        cache.discard(|_, _| {});
        assert_eq!(cache.backfill_len(), 1);

        assert!(cache.find(&1).is_some());
        assert_eq!(cache.discard_and_swap(|_, _| {}), 0);
        assert_eq!(cache.current_len(), 1);
    }

    #[test]
    fn hits_do_not_serialize_readers() {
        let cache = Cache::new();
        cache.lock_write().add(1, Arc::new(Entry("a")));

        // An upgradable holder excludes other upgradable guards, not readers.
        let _upgradable = cache.maps.upgradable_read();
        thread::scope(|scope| {
            let hit = scope.spawn(|| matches!(cache.find_or_lock(&1), Lookup::Found(_)));
            assert!(hit.join().unwrap());
        });
    }

    #[test]
    fn find_or_lock_promotes_from_backfill() {
        let cache = Cache::new();
        let value = Arc::new(Entry("a"));
        cache.lock_write().add(1, Arc::clone(&value));
        cache.discard(|_, _| {});

        match cache.find_or_lock(&1) {
            Lookup::Found(found) => assert!(Arc::ptr_eq(&found, &value)),
            Lookup::Vacant(_) => panic!("expected a hit"),
        }
        assert_eq!(cache.current_len(), 1);
        assert_eq!(cache.backfill_len(), 0);
    }

    #[test]
    fn blocked_lookup_observes_concurrent_insert() {
        let cache = Arc::new(Cache::new());
        let inserted = Arc::new(Entry("v1"));

        let Lookup::Vacant(mut guard) = cache.find_or_lock(&7) else {
            panic!("expected a miss");
        };

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || match cache.find_or_lock(&7) {
                Lookup::Found(value) => value,
                Lookup::Vacant(_) => panic!("second lookup must see the first insert"),
            })
        };

        // Give the waiter time to block on the lock.
        thread::sleep(Duration::from_millis(20));
        assert!(guard.add(7, Arc::clone(&inserted)));
        drop(guard);

        let seen = waiter.join().unwrap();
        assert!(Arc::ptr_eq(&seen, &inserted));
    }

    #[test]
    fn remove_if_checks_the_stored_value() {
        let cache = Cache::new();
        let first = Arc::new(Entry("a"));
        cache.lock_write().add(1, Arc::clone(&first));

        let other = Arc::new(Entry("b"));
        assert!(cache.lock_write().remove_if(&1, |v| Arc::ptr_eq(v, &other)).is_none());
        assert!(cache.lock_write().remove_if(&1, |v| Arc::ptr_eq(v, &first)).is_some());
        assert!(cache.is_empty());
    }
}
