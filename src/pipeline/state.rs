//! Pipeline State Entries
//!
//! A [`PipelineState`] is the value stored in the cache for one key. It is
//! created on a miss and shared through `Arc` by every thread that finds it.
//!
//! # Lifecycle
//! - **Pending**: inserted before its compile finished. [`compiled`] is `None`
//!   and [`pending_signal`] returns the signal the caller's command stream
//!   must wait on.
//! - **Ready**: the backend object is available.
//! - **Failed**: the asynchronous compile returned an error. The cache purges
//!   failed entries so a later lookup recompiles.
//!
//! Graphics entries additionally carry an in-use counter, acquired through the
//! RAII [`InUseGuard`] while a draw is being recorded against the entry. The
//! cache refuses to release an entry whose counter is non-zero.
//!
//! [`compiled`]: PipelineState::compiled
//! [`pending_signal`]: PipelineState::pending_signal

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::errors::CompileError;
use crate::tasks::CompletionSignal;

type CompileOutcome<P> = std::result::Result<Arc<P>, CompileError>;

/// Per-entry usage counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    hits: AtomicU64,
    last_used_frame: AtomicU64,
}

impl PipelineStats {
    #[inline]
    pub fn record_use(&self, frame: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_used_frame.fetch_max(frame, Ordering::Relaxed);
    }

    /// Number of lookups that found this entry.
    #[inline]
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::Relaxed)
    }
}

/// Cache entry holding a (possibly not yet compiled) backend object.
pub struct PipelineState<P> {
    compiled: OnceLock<CompileOutcome<P>>,
    pending: Mutex<Option<CompletionSignal>>,
    stats: PipelineStats,
}

impl<P> Default for PipelineState<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PipelineState<P> {
    /// An entry whose compile has not produced a result yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            compiled: OnceLock::new(),
            pending: Mutex::new(None),
            stats: PipelineStats::default(),
        }
    }

    /// An entry that is ready from the start.
    #[must_use]
    pub fn with_compiled(pipeline: P) -> Self {
        let state = Self::new();
        state.store_outcome(Ok(pipeline));
        state
    }

    /// Stores the compile result. Each entry is compiled exactly once.
    pub(crate) fn store_outcome(&self, outcome: std::result::Result<P, CompileError>) {
        let stored = self.compiled.set(outcome.map(Arc::new)).is_ok();
        assert!(stored, "pipeline state compiled twice");
    }

    /// Marks an asynchronous compile as in flight for this entry.
    pub(crate) fn set_pending(&self, signal: CompletionSignal) {
        let mut pending = self.pending.lock();
        debug_assert!(pending.is_none(), "pipeline state already has a compile in flight");
        *pending = Some(signal);
    }

    /// The compiled backend object, if the compile succeeded.
    #[inline]
    #[must_use]
    pub fn compiled(&self) -> Option<Arc<P>> {
        match self.compiled.get() {
            Some(Ok(pipeline)) => Some(Arc::clone(pipeline)),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.compiled.get(), Some(Ok(_)))
    }

    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.compiled.get(), Some(Err(_)))
    }

    #[must_use]
    pub fn compile_error(&self) -> Option<&CompileError> {
        self.compiled.get().and_then(|outcome| outcome.as_ref().err())
    }

    /// The signal of a compile that is still running.
    ///
    /// A signal found complete is cleared, so once this returns `None` it
    /// keeps returning `None`.
    #[must_use]
    pub fn pending_signal(&self) -> Option<CompletionSignal> {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(signal) if signal.is_complete() => {
                *pending = None;
                None
            }
            Some(signal) => Some(signal.clone()),
            None => None,
        }
    }

    /// `true` while an asynchronous compile for this entry is still running.
    #[inline]
    #[must_use]
    pub fn is_compile_running(&self) -> bool {
        self.pending_signal().is_some()
    }

    /// Blocks until any in-flight compile for this entry has finished.
    ///
    /// Returns `true` if the caller actually had to wait.
    pub fn wait_for_compile(&self) -> bool {
        match self.pending_signal() {
            Some(signal) => {
                signal.wait();
                self.pending.lock().take();
                true
            }
            None => false,
        }
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

impl<P> fmt::Debug for PipelineState<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("ready", &self.is_ready())
            .field("failed", &self.is_failed())
            .field("pending", &self.pending.lock().is_some())
            .field("hits", &self.stats.hits())
            .finish()
    }
}

/// Compute pipeline entries carry no extra state.
pub type ComputePipelineState<P> = PipelineState<P>;

/// Graphics pipeline entry: a [`PipelineState`] plus an in-use counter.
pub struct GraphicsPipelineState<P> {
    base: PipelineState<P>,
    in_use: AtomicI32,
}

impl<P> Default for GraphicsPipelineState<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GraphicsPipelineState<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: PipelineState::new(),
            in_use: AtomicI32::new(0),
        }
    }

    #[must_use]
    pub fn with_compiled(pipeline: P) -> Self {
        Self {
            base: PipelineState::with_compiled(pipeline),
            in_use: AtomicI32::new(0),
        }
    }

    /// Marks the entry as used by a draw until the guard is dropped.
    #[must_use = "the entry is only marked in use while the guard lives"]
    pub fn begin_use(&self) -> InUseGuard<'_> {
        self.in_use.fetch_add(1, Ordering::Acquire);
        InUseGuard {
            counter: &self.in_use,
        }
    }

    /// Number of live [`InUseGuard`]s.
    #[inline]
    #[must_use]
    pub fn in_use_count(&self) -> i32 {
        self.in_use.load(Ordering::Acquire)
    }
}

impl<P> Deref for GraphicsPipelineState<P> {
    type Target = PipelineState<P>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<P> fmt::Debug for GraphicsPipelineState<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsPipelineState")
            .field("base", &self.base)
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

/// Keeps a graphics entry marked as in use.
#[derive(Debug)]
pub struct InUseGuard<'a> {
    counter: &'a AtomicI32,
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "pipeline in-use count went negative");
    }
}

/// Liveness queries the caches make before releasing an entry.
pub trait TrackedEntry {
    /// Outstanding users. Must be zero when the entry is released.
    fn in_use_count(&self) -> i32 {
        0
    }

    /// `true` while a background compile still writes into the entry.
    fn is_compile_running(&self) -> bool {
        false
    }
}

impl<P> TrackedEntry for PipelineState<P> {
    fn is_compile_running(&self) -> bool {
        self.pending_signal().is_some()
    }
}

impl<P> TrackedEntry for GraphicsPipelineState<P> {
    fn in_use_count(&self) -> i32 {
        self.in_use.load(Ordering::Acquire)
    }

    fn is_compile_running(&self) -> bool {
        self.base.pending_signal().is_some()
    }
}

/// Entries an [`AsyncCompileTask`] can fill in.
///
/// [`AsyncCompileTask`]: crate::pipeline::compile::AsyncCompileTask
pub trait CompileTarget: Send + Sync + 'static {
    type Pipeline: Send + Sync + 'static;

    fn pipeline_state(&self) -> &PipelineState<Self::Pipeline>;
}

impl<P: Send + Sync + 'static> CompileTarget for PipelineState<P> {
    type Pipeline = P;

    fn pipeline_state(&self) -> &PipelineState<P> {
        self
    }
}

impl<P: Send + Sync + 'static> CompileTarget for GraphicsPipelineState<P> {
    type Pipeline = P;

    fn pipeline_state(&self) -> &PipelineState<P> {
        &self.base
    }
}
