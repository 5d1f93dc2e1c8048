//! Pipeline State Cache
//!
//! [`PipelineStateCache`] is the public entry point. It owns one cache per
//! pipeline family and drives them from the frame loop:
//!
//! | Family   | Container                       | Lookup cost                         |
//! |----------|---------------------------------|-------------------------------------|
//! | Graphics | [`SharedPipelineStateCache`]    | read lock + thread-local map        |
//! | Compute  | [`DiscardableKeyValueCache`]    | one coarse read/write lock          |
//!
//! # Usage
//!
//! ```rust,ignore
//! let cache = PipelineStateCache::with_worker_pool(backend, settings)?;
//!
//! // Any thread, once per draw:
//! let mut cmd = CommandList::new();
//! let pso = cache.get_or_create_graphics(&key, &mut cmd)?;
//!
//! // Render thread, once per frame, while no draw is being recorded:
//! cache.begin_frame();
//! ```
//!
//! # Compile Policy
//!
//! A miss compiles on the scheduler when asynchronous compilation is enabled
//! and the command context is not in immediate mode. The entry is returned
//! right away with its completion signal queued on the context; otherwise
//! the calling thread compiles inline.
//!
//! [`SharedPipelineStateCache`]: crate::cache::SharedPipelineStateCache
//! [`DiscardableKeyValueCache`]: crate::cache::DiscardableKeyValueCache

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::{DiscardableKeyValueCache, Lookup, SharedPipelineStateCache};
use crate::errors::{CompileError, PipelineError, Result};
use crate::pipeline::backend::PipelineBackend;
use crate::pipeline::compile::AsyncCompileTask;
use crate::pipeline::pipeline_key::{ComputePipelineKey, GraphicsPipelineKey};
use crate::pipeline::state::{CompileTarget, ComputePipelineState, GraphicsPipelineState};
use crate::settings::PipelineCacheSettings;
use crate::tasks::{CommandContext, InlineScheduler, TaskScheduler, WorkerPool};
use crate::utils::{EvictionTimer, Instant};

pub type GraphicsEntry<B> = Arc<GraphicsPipelineState<<B as PipelineBackend>::GraphicsPipeline>>;
pub type ComputeEntry<B> = Arc<ComputePipelineState<<B as PipelineBackend>::ComputePipeline>>;

/// Snapshot of cache-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub graphics_hits: u64,
    pub graphics_misses: u64,
    pub compute_hits: u64,
    pub compute_misses: u64,
    /// Racing graphics compiles resolved at consolidation.
    pub duplicates_discarded: u64,
    pub graphics_evicted: u64,
    pub compute_evicted: u64,
    pub compile_failures: u64,
    /// Consolidated graphics entries (current + backfill).
    pub graphics_live: usize,
    pub compute_live: usize,
}

#[derive(Debug, Default)]
struct Counters {
    graphics_hits: AtomicU64,
    graphics_misses: AtomicU64,
    compute_hits: AtomicU64,
    compute_misses: AtomicU64,
    duplicates_discarded: AtomicU64,
    graphics_evicted: AtomicU64,
    compute_evicted: AtomicU64,
    compile_failures: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

/// What one [`PipelineStateCache::begin_frame`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Index of the frame that just began.
    pub frame: u64,
    pub merged: usize,
    pub duplicates: usize,
    /// Failed graphics entries removed from the cache.
    pub purged: usize,
    /// Queued graphics entries released by delayed cleanup.
    pub released: usize,
    /// `true` when the eviction timer fired this frame.
    pub eviction_ran: bool,
    pub graphics_evicted: usize,
    pub compute_evicted: usize,
}

/// Thread-safe pipeline cache over a [`PipelineBackend`].
pub struct PipelineStateCache<B: PipelineBackend> {
    backend: Arc<B>,
    scheduler: Arc<dyn TaskScheduler>,
    settings: PipelineCacheSettings,
    async_compilation: AtomicBool,

    graphics: SharedPipelineStateCache<GraphicsPipelineKey, GraphicsEntry<B>>,
    compute: DiscardableKeyValueCache<ComputePipelineKey, ComputeEntry<B>>,

    eviction: Mutex<EvictionTimer>,
    frame: AtomicU64,
    counters: Arc<Counters>,
}

impl<B: PipelineBackend> PipelineStateCache<B> {
    /// Cache whose asynchronous compiles run on `scheduler`.
    pub fn new(
        backend: Arc<B>,
        scheduler: Arc<dyn TaskScheduler>,
        settings: PipelineCacheSettings,
    ) -> Self {
        Self::starting_at(backend, scheduler, settings, Instant::now())
    }

    /// Like [`new`](Self::new), with the eviction timer started at `now`.
    pub fn starting_at(
        backend: Arc<B>,
        scheduler: Arc<dyn TaskScheduler>,
        settings: PipelineCacheSettings,
        now: Instant,
    ) -> Self {
        Self {
            backend,
            scheduler,
            settings,
            async_compilation: AtomicBool::new(settings.async_compilation),
            graphics: SharedPipelineStateCache::new(),
            compute: DiscardableKeyValueCache::new(),
            eviction: Mutex::new(EvictionTimer::starting_at(settings.eviction_interval(), now)),
            frame: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cache backed by a [`WorkerPool`] sized from `settings`.
    pub fn with_worker_pool(backend: Arc<B>, settings: PipelineCacheSettings) -> io::Result<Self> {
        let pool = WorkerPool::from_settings(&settings)?;
        Ok(Self::new(backend, Arc::new(pool), settings))
    }

    /// Cache that compiles every miss on the calling thread.
    pub fn inline(backend: Arc<B>, settings: PipelineCacheSettings) -> Self {
        Self::new(backend, Arc::new(InlineScheduler), settings)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Returns the graphics pipeline for `key`, compiling it on a miss.
    ///
    /// The key's render-target fields must already describe the bound
    /// targets (see [`GraphicsPipelineKey::apply_render_targets`]).
    pub fn get_or_create_graphics<C>(
        &self,
        key: &GraphicsPipelineKey,
        ctx: &mut C,
    ) -> Result<GraphicsEntry<B>>
    where
        C: CommandContext + ?Sized,
    {
        if let Some(entry) = self.graphics.find(key) {
            Counters::bump(&self.counters.graphics_hits, 1);
            self.observe_hit(&*entry, || key.debug_label().into_owned(), ctx)?;
            return Ok(entry);
        }

        Counters::bump(&self.counters.graphics_misses, 1);
        let entry = Arc::new(GraphicsPipelineState::new());
        let backend = Arc::clone(&self.backend);
        self.compile_into(&entry, key, ctx, move |k| {
            backend.compile_graphics_pipeline(k)
        })?;
        self.graphics.add(key.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Returns the compute pipeline for `key`, compiling it on a miss.
    pub fn get_or_create_compute<C>(
        &self,
        key: &ComputePipelineKey,
        ctx: &mut C,
    ) -> Result<ComputeEntry<B>>
    where
        C: CommandContext + ?Sized,
    {
        loop {
            let mut guard = match self.compute.find_or_lock(key) {
                Lookup::Found(entry) => {
                    Counters::bump(&self.counters.compute_hits, 1);
                    let observed =
                        self.observe_hit(&*entry, || key.debug_label().into_owned(), ctx);
                    if let Err(err) = observed {
                        self.compute
                            .lock_write()
                            .remove_if(key, |stored| Arc::ptr_eq(stored, &entry));
                        warn!("Purged failed compute pipeline '{}'", key.debug_label());
                        return Err(err);
                    }
                    return Ok(entry);
                }
                Lookup::Vacant(guard) => guard,
            };

            Counters::bump(&self.counters.compute_misses, 1);
            let entry = Arc::new(ComputePipelineState::new());
            let backend = Arc::clone(&self.backend);
            self.compile_into(&entry, key, ctx, move |k| {
                backend.compile_compute_pipeline(k)
            })?;
            if guard.add(key.clone(), Arc::clone(&entry)) {
                return Ok(entry);
            }
            // Lost the insert race: the key is now current, look it up again.
        }
    }

    /// Shared hit path: stats, failed-compile check and signal re-queue.
    fn observe_hit<S, C>(
        &self,
        entry: &S,
        label: impl FnOnce() -> String,
        ctx: &mut C,
    ) -> Result<()>
    where
        S: CompileTarget,
        C: CommandContext + ?Sized,
    {
        let state = entry.pipeline_state();
        state.stats().record_use(self.frame_index());

        if let Some(err) = state.compile_error() {
            return Err(PipelineError::Unavailable {
                label: label(),
                source: err.clone(),
            });
        }
        if let Some(signal) = state.pending_signal() {
            ctx.wait_on(&signal);
        }
        Ok(())
    }

    /// Compiles `key` into `entry`, inline or on the scheduler.
    ///
    /// On the asynchronous path the signal is attached to the entry before
    /// this returns, so callers may publish the entry afterwards.
    fn compile_into<S, K, C, F>(
        &self,
        entry: &Arc<S>,
        key: &K,
        ctx: &mut C,
        compile: F,
    ) -> Result<()>
    where
        S: CompileTarget,
        K: Clone + Send + 'static + LabeledKey,
        C: CommandContext + ?Sized,
        F: FnOnce(&K) -> std::result::Result<S::Pipeline, CompileError> + Send + 'static,
    {
        let label = key.label_for_log();
        entry.pipeline_state().stats().record_use(self.frame_index());

        if self.is_async_compilation() && !ctx.is_immediate() {
            let counters = Arc::clone(&self.counters);
            let task = AsyncCompileTask::new(Arc::clone(entry), key.clone(), label, move |k: &K| {
                let outcome = compile(k);
                if outcome.is_err() {
                    Counters::bump(&counters.compile_failures, 1);
                }
                outcome
            });
            let signal = task.dispatch(&*self.scheduler);
            ctx.wait_on(&signal);
            return Ok(());
        }

        match compile(key) {
            Ok(pipeline) => {
                entry.pipeline_state().store_outcome(Ok(pipeline));
                Ok(())
            }
            Err(err) => {
                Counters::bump(&self.counters.compile_failures, 1);
                error!("Compile of pipeline '{label}' failed: {err}");
                Err(err.into())
            }
        }
    }

    // ========================================================================
    // Frame driver
    // ========================================================================

    /// Per-frame maintenance, timed with `Instant::now()`.
    pub fn begin_frame(&self) -> FrameReport {
        self.begin_frame_at(Instant::now())
    }

    /// Consolidates the graphics cache, releases duplicates and, when the
    /// eviction interval has elapsed at `now`, discards and swaps both caches.
    ///
    /// Must be called from one thread while no lookup is in flight.
    pub fn begin_frame_at(&self, now: Instant) -> FrameReport {
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let mut report = FrameReport {
            frame,
            ..FrameReport::default()
        };

        let mut token = self.graphics.begin_consolidation();
        let consolidation = token.consolidate_threaded_caches();
        report.merged = consolidation.merged;
        report.duplicates = consolidation.duplicates;

        report.purged = token.purge_where(|key, entry| {
            let failed = entry.is_failed();
            if failed {
                warn!("Purged failed graphics pipeline '{}'", key.debug_label());
            }
            failed
        });
        report.released =
            token.process_delayed_cleanup(|entry| release_entry(&*entry, "duplicate"));

        report.eviction_ran = self.eviction.lock().poll(now);
        if report.eviction_ran {
            report.graphics_evicted = token.discard_and_swap(|key, entry| {
                release_entry(&*entry, &key.debug_label());
            });
            report.compute_evicted = self.compute.discard_and_swap(|key, entry| {
                release_entry(&*entry, &key.debug_label());
            });
        } else {
            self.compute.end_frame();
        }
        drop(token);

        Counters::bump(&self.counters.duplicates_discarded, report.duplicates);
        Counters::bump(&self.counters.graphics_evicted, report.graphics_evicted);
        Counters::bump(&self.counters.compute_evicted, report.compute_evicted);

        let touched = report.merged
            + report.duplicates
            + report.purged
            + report.graphics_evicted
            + report.compute_evicted;
        if touched > 0 {
            debug!(
                "Pipeline cache frame {frame}: merged {}, duplicates {}, purged {}, evicted {} graphics / {} compute",
                report.merged,
                report.duplicates,
                report.purged,
                report.graphics_evicted,
                report.compute_evicted
            );
        }
        report
    }

    /// Destroys every cached pipeline regardless of generation.
    ///
    /// Used at shutdown and after device loss. Must be called under the same
    /// conditions as [`begin_frame`](Self::begin_frame). Returns the number
    /// of entries destroyed.
    pub fn clear_all(&self) -> usize {
        let mut token = self.graphics.begin_consolidation();
        token.consolidate_threaded_caches();
        let mut destroyed =
            token.drain_delayed_cleanup(|entry| release_entry(&*entry, "duplicate"));
        destroyed += token.flush(|key, entry| release_entry(&*entry, &key.debug_label()));
        drop(token);

        let mut compute = self.compute.lock_write();
        for _ in 0..2 {
            destroyed += compute.discard(|key, entry| release_entry(&*entry, &key.debug_label()));
        }
        drop(compute);

        info!("Pipeline cache cleared, {destroyed} pipeline(s) destroyed");
        destroyed
    }

    // ========================================================================
    // Configuration & Introspection
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn is_async_compilation(&self) -> bool {
        self.async_compilation.load(Ordering::Relaxed)
    }

    /// Toggles the compile policy for subsequent misses.
    pub fn set_async_compilation(&self, enabled: bool) {
        self.async_compilation.store(enabled, Ordering::Relaxed);
    }

    /// The settings in effect, including runtime overrides.
    #[must_use]
    pub fn settings(&self) -> PipelineCacheSettings {
        self.settings
            .with_async_compilation(self.is_async_compilation())
    }

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of [`begin_frame`](Self::begin_frame) calls so far.
    #[inline]
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn graphics_cache(
        &self,
    ) -> &SharedPipelineStateCache<GraphicsPipelineKey, GraphicsEntry<B>> {
        &self.graphics
    }

    #[inline]
    #[must_use]
    pub fn compute_cache(&self) -> &DiscardableKeyValueCache<ComputePipelineKey, ComputeEntry<B>> {
        &self.compute
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &*self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            graphics_hits: load(&c.graphics_hits),
            graphics_misses: load(&c.graphics_misses),
            compute_hits: load(&c.compute_hits),
            compute_misses: load(&c.compute_misses),
            duplicates_discarded: load(&c.duplicates_discarded),
            graphics_evicted: load(&c.graphics_evicted),
            compute_evicted: load(&c.compute_evicted),
            compile_failures: load(&c.compile_failures),
            graphics_live: self.graphics.current_len() + self.graphics.backfill_len(),
            compute_live: self.compute.len(),
        }
    }
}

/// Keys that can name themselves in logs.
pub(crate) trait LabeledKey {
    fn label_for_log(&self) -> String;
}

impl LabeledKey for GraphicsPipelineKey {
    fn label_for_log(&self) -> String {
        self.debug_label().into_owned()
    }
}

impl LabeledKey for ComputePipelineKey {
    fn label_for_log(&self) -> String {
        self.debug_label().into_owned()
    }
}

/// Final release of an entry leaving the cache.
///
/// A compile still writing into the entry is waited for first.
fn release_entry<S: CompileTarget + ?Sized>(entry: &S, label: &str) {
    if entry.pipeline_state().wait_for_compile() {
        warn!("Released pipeline '{label}' had to wait for its compile to finish");
    }
}
