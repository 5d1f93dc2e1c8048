//! Thread-staged two-generation cache.
//!
//! Tuned for many threads performing one lookup per draw call:
//!
//! - **current** is only written while a [`ConsolidationToken`] is held, so
//!   lookups take an uncontended read lock.
//! - each calling thread owns a private **staging** map. New entries land
//!   there and stay invisible to other threads until the next consolidation.
//! - **backfill** holds last cycle's entries behind its own lock. A backfill
//!   hit is copied into the caller's staging map.
//!
//! # Frame protocol
//!
//! Once per frame the designated thread, with no lookups in flight, does:
//!
//! ```text
//! let mut token = cache.begin_consolidation();
//! token.consolidate_threaded_caches();   // staging -> current, duplicates queued
//! token.process_delayed_cleanup(..);     // queued duplicates released
//! token.discard_and_swap(..);            // optional, on the eviction timer
//! ```
//!
//! Two threads compiling the same key in the same frame is expected. The
//! copies meet at consolidation, one is kept and the other queued for release.
//!
//! # Access counter
//!
//! `find`/`add` increment an atomic counter for their duration and require
//! it to be non-negative. `begin_consolidation` swaps it from zero to a
//! large negative sentinel. A lookup overlapping a consolidation, or a
//! consolidation overlapping a lookup, panics.

use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::CacheValue;

const CONSOLIDATING: i32 = i32::MIN / 2;

type StagingMap<K, V> = Mutex<FxHashMap<K, V>>;

/// Counts produced by one consolidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Entries moved from staging into current.
    pub merged: usize,
    /// Entries found twice and queued for delayed release.
    pub duplicates: usize,
}

/// Graphics pipeline cache with per-thread staging.
pub struct SharedPipelineStateCache<K, V> {
    current: RwLock<FxHashMap<K, V>>,
    backfill: Mutex<FxHashMap<K, V>>,
    staging: RwLock<FxHashMap<ThreadId, StagingMap<K, V>>>,
    pending_release: Mutex<Vec<V>>,
    access: AtomicI32,
    owner: Mutex<Option<ThreadId>>,
}

impl<K: Eq + Hash + Clone, V: CacheValue> Default for SharedPipelineStateCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a lookup in flight for the duration of `find`/`add`.
struct AccessGuard<'a> {
    counter: &'a AtomicI32,
}

impl<'a> AccessGuard<'a> {
    fn enter(counter: &'a AtomicI32) -> Self {
        let prev = counter.fetch_add(1, Ordering::AcqRel);
        if prev < 0 {
            counter.fetch_sub(1, Ordering::AcqRel);
            panic!("pipeline cache accessed while a consolidation is running");
        }
        Self { counter }
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<K: Eq + Hash + Clone, V: CacheValue> SharedPipelineStateCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(FxHashMap::default()),
            backfill: Mutex::new(FxHashMap::default()),
            staging: RwLock::new(FxHashMap::default()),
            pending_release: Mutex::new(Vec::new()),
            access: AtomicI32::new(0),
            owner: Mutex::new(None),
        }
    }

    /// Looks `key` up in current, then the calling thread's staging map,
    /// then backfill. A backfill hit is copied into the staging map.
    pub fn find(&self, key: &K) -> Option<V> {
        let _access = AccessGuard::enter(&self.access);

        if let Some(value) = self.current.read().get(key) {
            return Some(value.clone());
        }
        if let Some(value) = self.with_local_map(|local| local.get(key).cloned()) {
            return Some(value);
        }

        let value = self.backfill.lock().get(key).cloned()?;
        self.with_local_map(|local| local.insert(key.clone(), value.clone()));
        Some(value)
    }

    /// Stages a new entry on the calling thread.
    ///
    /// The caller must have missed on [`find`](Self::find) first; adding a
    /// key twice to the same staging map panics.
    pub fn add(&self, key: K, value: V) {
        let _access = AccessGuard::enter(&self.access);
        self.with_local_map(|local| match local.entry(key) {
            Entry::Occupied(_) => panic!("key added twice to a thread-local pipeline cache"),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        });
    }

    /// Non-promoting lookup across current, backfill and the calling
    /// thread's staging map.
    pub fn peek(&self, key: &K) -> Option<V> {
        let _access = AccessGuard::enter(&self.access);
        if let Some(value) = self.current.read().get(key) {
            return Some(value.clone());
        }
        if let Some(value) = self.with_local_map(|local| local.get(key).cloned()) {
            return Some(value);
        }
        self.backfill.lock().get(key).cloned()
    }

    /// Enters the consolidation phase.
    ///
    /// Must be called from the designated thread (the first thread that ever
    /// consolidates this cache) while no `find`/`add` is in flight.
    pub fn begin_consolidation(&self) -> ConsolidationToken<'_, K, V> {
        let id = thread::current().id();
        {
            let mut owner = self.owner.lock();
            match *owner {
                None => *owner = Some(id),
                Some(designated) => assert_eq!(
                    designated, id,
                    "pipeline cache consolidated from a thread other than the designated one"
                ),
            }
        }

        if let Err(active) =
            self.access
                .compare_exchange(0, CONSOLIDATING, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!("pipeline cache consolidation started with {active} lookup(s) in flight");
        }

        ConsolidationToken {
            cache: self,
            consolidated: false,
            cleaned: false,
            fresh: Vec::new(),
        }
    }

    #[must_use]
    pub fn current_len(&self) -> usize {
        self.current.read().len()
    }

    #[must_use]
    pub fn backfill_len(&self) -> usize {
        self.backfill.lock().len()
    }

    /// Entries staged on all threads and not yet consolidated.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staging.read().values().map(|local| local.lock().len()).sum()
    }

    /// Threads with a registered staging map.
    #[must_use]
    pub fn staging_threads(&self) -> usize {
        self.staging.read().len()
    }

    /// Entries waiting for [`ConsolidationToken::process_delayed_cleanup`].
    #[must_use]
    pub fn pending_release_len(&self) -> usize {
        self.pending_release.lock().len()
    }

    /// Runs `f` on the calling thread's staging map, creating it on first use.
    fn with_local_map<R>(&self, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        let id = thread::current().id();
        {
            let registry = self.staging.read();
            if let Some(local) = registry.get(&id) {
                return f(&mut local.lock());
            }
        }
        let mut registry = self.staging.write();
        let local = registry.entry(id).or_default();
        f(local.get_mut())
    }
}

/// Exclusive phase during which the cache's generations can be rewritten.
///
/// Dropping the token re-opens the cache for lookups.
pub struct ConsolidationToken<'a, K, V> {
    cache: &'a SharedPipelineStateCache<K, V>,
    consolidated: bool,
    cleaned: bool,
    /// Keys merged into current by this pass.
    fresh: Vec<K>,
}

impl<K: Eq + Hash + Clone, V: CacheValue> ConsolidationToken<'_, K, V> {
    /// Merges every thread's staging map into current.
    ///
    /// A key that is already current (another thread staged it this frame)
    /// keeps the current value; the staged copy is queued for release.
    ///
    /// Staging maps that were already empty belong to threads that did not
    /// touch the cache since the last pass; they are dropped from the
    /// registry.
    pub fn consolidate_threaded_caches(&mut self) -> ConsolidationReport {
        let cache = self.cache;
        let mut registry = cache.staging.write();
        let mut current = cache.current.write();
        let mut backfill = cache.backfill.lock();
        let mut pending = cache.pending_release.lock();
        let fresh = &mut self.fresh;
        let mut report = ConsolidationReport::default();

        registry.retain(|_, local| {
            let local = local.get_mut();
            if local.is_empty() {
                return false;
            }
            for (key, value) in local.drain() {
                // A staged copy of a backfill hit takes the backfill slot with it.
                if let Some(stale) = backfill.remove(&key)
                    && !stale.same_entry(&value)
                {
                    pending.push(stale);
                    report.duplicates += 1;
                }

                match current.entry(key) {
                    Entry::Occupied(existing) => {
                        if !existing.get().same_entry(&value) {
                            pending.push(value);
                            report.duplicates += 1;
                        }
                    }
                    Entry::Vacant(slot) => {
                        fresh.push(slot.key().clone());
                        slot.insert(value);
                        report.merged += 1;
                    }
                }
            }
            true
        });

        self.consolidated = true;
        report
    }

    /// Removes entries matching `predicate` from both generations and queues
    /// them for release. Must run between consolidation and cleanup.
    pub fn purge_where(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) -> usize {
        assert!(
            self.consolidated && !self.cleaned,
            "purge_where must run after consolidation and before delayed cleanup"
        );
        let cache = self.cache;
        let mut current = cache.current.write();
        let mut backfill = cache.backfill.lock();
        let mut pending = cache.pending_release.lock();

        let before = pending.len();
        for map in [&mut *current, &mut *backfill] {
            map.retain(|key, value| {
                if predicate(key, value) {
                    pending.push(value.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.fresh.retain(|key| current.contains_key(key));
        pending.len() - before
    }

    /// Releases the entries queued by consolidation or purging.
    ///
    /// Entries whose background compile is still running stay queued for the
    /// next frame. Returns the number released.
    pub fn process_delayed_cleanup(&mut self, mut on_release: impl FnMut(V)) -> usize {
        assert!(
            self.consolidated,
            "delayed cleanup must run after consolidation"
        );
        let mut pending = self.cache.pending_release.lock();
        let queued = std::mem::take(&mut *pending);
        let mut released = 0;
        for value in queued {
            if value.is_compile_running() {
                pending.push(value);
                continue;
            }
            assert_eq!(
                value.in_use_count(),
                0,
                "pipeline released while still in use"
            );
            on_release(value);
            released += 1;
        }
        self.cleaned = true;
        released
    }

    /// Releases every queued entry, including those still compiling.
    /// `on_release` is responsible for waiting on them.
    pub fn drain_delayed_cleanup(&mut self, mut on_release: impl FnMut(V)) -> usize {
        assert!(
            self.consolidated,
            "delayed cleanup must run after consolidation"
        );
        let queued = std::mem::take(&mut *self.cache.pending_release.lock());
        let released = queued.len();
        for value in queued {
            assert_eq!(
                value.in_use_count(),
                0,
                "pipeline released while still in use"
            );
            on_release(value);
        }
        self.cleaned = true;
        released
    }

    /// Evicts everything left in backfill and swaps the generations.
    ///
    /// Entries merged by this token's consolidation stay current: they begin
    /// aging with the next cycle.
    pub fn discard_and_swap(&mut self, on_evict: impl FnMut(K, V)) -> usize {
        assert!(
            self.consolidated && self.cleaned,
            "discard_and_swap must run after consolidation and delayed cleanup"
        );
        let fresh = std::mem::take(&mut self.fresh);
        self.swap_generations(&fresh, on_evict)
    }

    /// Evicts every entry in both generations.
    pub fn flush(&mut self, mut on_evict: impl FnMut(K, V)) -> usize {
        assert!(
            self.consolidated && self.cleaned,
            "flush must run after consolidation and delayed cleanup"
        );
        self.fresh.clear();
        self.swap_generations(&[], &mut on_evict) + self.swap_generations(&[], &mut on_evict)
    }

    fn swap_generations(&mut self, keep: &[K], mut on_evict: impl FnMut(K, V)) -> usize {
        let cache = self.cache;
        let mut current = cache.current.write();
        let mut backfill = cache.backfill.lock();

        let evicted = backfill.len();
        for (key, value) in backfill.drain() {
            assert_eq!(
                value.in_use_count(),
                0,
                "pipeline evicted while still in use"
            );
            on_evict(key, value);
        }
        std::mem::swap(&mut *current, &mut *backfill);

        for key in keep {
            if let Some((key, value)) = backfill.remove_entry(key) {
                current.insert(key, value);
            }
        }
        evicted
    }
}

impl<K, V> Drop for ConsolidationToken<'_, K, V> {
    fn drop(&mut self) {
        let reopened = self
            .cache
            .access
            .compare_exchange(CONSOLIDATING, 0, Ordering::AcqRel, Ordering::Acquire);
        if let Err(state) = reopened
            && !thread::panicking()
        {
            panic!("pipeline cache access counter corrupted during consolidation: {state}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    use crate::pipeline::state::TrackedEntry;

    #[derive(Debug)]
    struct Entry(&'static str);

    impl TrackedEntry for Entry {}

    #[derive(Debug, Default)]
    struct Compiling(std::sync::atomic::AtomicBool);

    impl TrackedEntry for Compiling {
        fn is_compile_running(&self) -> bool {
            !self.0.load(Ordering::Acquire)
        }
    }

    type Cache = SharedPipelineStateCache<u32, Arc<Entry>>;

    fn run_frame(cache: &Cache, evict: bool) -> (ConsolidationReport, usize) {
        let mut token = cache.begin_consolidation();
        let report = token.consolidate_threaded_caches();
        token.process_delayed_cleanup(drop);
        let evicted = if evict {
            token.discard_and_swap(|_, _| {})
        } else {
            0
        };
        (report, evicted)
    }

    #[test]
    fn find_on_empty_cache_has_no_side_effects() {
        let cache = Cache::new();
        assert!(cache.find(&1).is_none());
        assert_eq!(cache.staged_len(), 0);
        assert_eq!(cache.current_len(), 0);
    }

    #[test]
    fn staged_entries_are_thread_private_until_consolidation() {
        let cache = Arc::new(Cache::new());
        cache.add(1, Arc::new(Entry("a")));
        assert!(cache.find(&1).is_some());

        let other = Arc::clone(&cache);
        let seen = thread::spawn(move || other.find(&1).is_some())
            .join()
            .unwrap();
        assert!(!seen);

        let (report, _) = run_frame(&cache, false);
        assert_eq!(report.merged, 1);

        let other = Arc::clone(&cache);
        let seen = thread::spawn(move || other.find(&1).is_some())
            .join()
            .unwrap();
        assert!(seen);
    }

    #[test]
    fn idle_thread_maps_are_dropped() {
        let cache = Cache::new();
        thread::scope(|scope| {
            for key in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    if key % 2 == 0 {
                        cache.add(key, Arc::new(Entry("staged")));
                    } else {
                        assert!(cache.find(&key).is_none());
                    }
                });
            }
        });
        assert_eq!(cache.staging_threads(), 8);

        // Threads that only missed are dropped right away.
        let (report, _) = run_frame(&cache, false);
        assert_eq!(report.merged, 4);
        assert_eq!(cache.staging_threads(), 4);

        run_frame(&cache, false);
        assert_eq!(cache.staging_threads(), 0);
        assert_eq!(cache.current_len(), 4);
    }

    #[test]
    #[should_panic(expected = "added twice")]
    fn duplicate_staging_add_panics() {
        let cache = Cache::new();
        cache.add(1, Arc::new(Entry("a")));
        cache.add(1, Arc::new(Entry("b")));
    }

    #[test]
    fn racing_inserts_keep_exactly_one_copy() {
        let cache = Arc::new(Cache::new());
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    assert!(cache.find(&9).is_none());
                    cache.add(9, Arc::new(Entry(name)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut token = cache.begin_consolidation();
        let report = token.consolidate_threaded_caches();
        assert_eq!(report.merged, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(cache.pending_release.lock().len(), 1);

        let mut released = Vec::new();
        assert_eq!(token.process_delayed_cleanup(|v| released.push(v)), 1);
        drop(token);

        let kept = cache.find(&9).unwrap();
        assert!(!kept.same_entry(&released[0]));
        assert_eq!(cache.current_len(), 1);
    }

    #[test]
    fn backfill_hit_is_staged_and_survives_swap() {
        let cache = Cache::new();
        let value = Arc::new(Entry("a"));
        cache.add(1, Arc::clone(&value));
        run_frame(&cache, false);
        run_frame(&cache, true);
        assert_eq!(cache.backfill_len(), 1);

        let found = cache.find(&1).unwrap();
        assert!(found.same_entry(&value));
        assert_eq!(cache.staged_len(), 1);

        let (report, evicted) = run_frame(&cache, true);
        assert_eq!(report.merged, 1);
        assert_eq!(report.duplicates, 0);
        assert_eq!(evicted, 0);
        assert!(cache.peek(&1).unwrap().same_entry(&value));
    }

    #[test]
    fn untouched_entry_needs_two_idle_cycles() {
        let cache = Cache::new();
        cache.add(1, Arc::new(Entry("a")));

        run_frame(&cache, true);
        assert_eq!(cache.current_len(), 1, "merged entries skip the first swap");
        run_frame(&cache, true);
        assert_eq!(cache.backfill_len(), 1);
        assert!(cache.peek(&1).is_some());

        let (_, evicted) = run_frame(&cache, true);
        assert_eq!(evicted, 1);
        assert!(cache.peek(&1).is_none());
    }

    #[test]
    fn flush_evicts_both_generations() {
        let cache = Cache::new();
        cache.add(1, Arc::new(Entry("a")));
        run_frame(&cache, true);
        run_frame(&cache, true);
        cache.add(2, Arc::new(Entry("b")));

        let mut token = cache.begin_consolidation();
        token.consolidate_threaded_caches();
        token.process_delayed_cleanup(drop);
        assert_eq!(token.flush(|_, _| {}), 2);
        drop(token);
        assert_eq!(cache.current_len() + cache.backfill_len(), 0);
    }

    #[test]
    fn purge_where_queues_matching_entries() {
        let cache = Cache::new();
        cache.add(1, Arc::new(Entry("keep")));
        cache.add(2, Arc::new(Entry("drop")));

        let mut token = cache.begin_consolidation();
        token.consolidate_threaded_caches();
        assert_eq!(token.purge_where(|_, v| v.0 == "drop"), 1);
        assert_eq!(token.process_delayed_cleanup(drop), 1);
        drop(token);

        assert!(cache.peek(&1).is_some());
        assert!(cache.peek(&2).is_none());
    }

    #[test]
    #[should_panic(expected = "after consolidation")]
    fn swap_before_consolidation_panics() {
        let cache = Cache::new();
        let mut token = cache.begin_consolidation();
        token.discard_and_swap(|_, _| {});
    }

    #[test]
    #[should_panic(expected = "while a consolidation is running")]
    fn lookup_during_consolidation_panics() {
        let cache = Cache::new();
        let _token = cache.begin_consolidation();
        let _ = cache.find(&1);
    }

    #[test]
    #[should_panic(expected = "designated")]
    fn consolidation_from_second_thread_panics() {
        let cache = Arc::new(Cache::new());
        drop(cache.begin_consolidation());

        let other = Arc::clone(&cache);
        let result = thread::spawn(move || {
            drop(other.begin_consolidation());
        })
        .join();
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn compiling_duplicate_waits_for_a_later_cleanup() {
        let cache = SharedPipelineStateCache::<u32, Arc<Compiling>>::new();
        let kept = Arc::new(Compiling::default());
        kept.0.store(true, Ordering::Release);
        let busy = Arc::new(Compiling::default());

        cache.add(1, Arc::clone(&kept));
        {
            let mut token = cache.begin_consolidation();
            token.consolidate_threaded_caches();
            token.process_delayed_cleanup(drop);
        }
        thread::scope(|scope| {
            scope.spawn(|| cache.add(1, Arc::clone(&busy)));
        });

        let mut token = cache.begin_consolidation();
        let report = token.consolidate_threaded_caches();
        assert_eq!(report.duplicates, 1);
        assert_eq!(token.process_delayed_cleanup(drop), 0);
        drop(token);
        assert_eq!(cache.pending_release_len(), 1);

        busy.0.store(true, Ordering::Release);
        let mut token = cache.begin_consolidation();
        token.consolidate_threaded_caches();
        assert_eq!(token.process_delayed_cleanup(drop), 1);
        drop(token);
        assert_eq!(cache.pending_release_len(), 0);
    }

    #[test]
    fn drain_releases_compiling_entries() {
        let cache = SharedPipelineStateCache::<u32, Arc<Compiling>>::new();
        cache.add(1, Arc::new(Compiling::default()));
        thread::scope(|scope| {
            scope.spawn(|| cache.add(1, Arc::new(Compiling::default())));
        });

        let mut token = cache.begin_consolidation();
        token.consolidate_threaded_caches();
        assert_eq!(token.drain_delayed_cleanup(drop), 1);
        assert_eq!(token.flush(|_, _| {}), 1);
    }
}
