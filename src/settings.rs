//! Pipeline Cache Settings
//!
//! Runtime configuration for [`PipelineStateCache`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use psocache::PipelineCacheSettings;
//!
//! // Defaults: asynchronous compilation, 60 second eviction cycle
//! let settings = PipelineCacheSettings::default();
//!
//! // Synchronous compilation and no eviction, e.g. for offline capture tools
//! let settings = PipelineCacheSettings::default()
//!     .with_async_compilation(false)
//!     .with_eviction_interval_secs(0);
//! ```
//!
//! [`PipelineStateCache`]: crate::pipeline::PipelineStateCache

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(target_arch = "wasm32")]
use web_time::Duration;

/// Default number of seconds between two discard-and-swap cycles.
pub const DEFAULT_EVICTION_INTERVAL_SECS: u32 = 60;

/// Configuration for the pipeline state cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineCacheSettings {
    /// Compile on a background worker when a lookup misses.
    ///
    /// Even when enabled, a command context in immediate mode forces the
    /// compile to happen inline.
    pub async_compilation: bool,

    /// Seconds between eviction cycles. `0` disables eviction entirely.
    pub eviction_interval_secs: u32,

    /// Number of compile workers for [`WorkerPool::from_settings`].
    ///
    /// `0` picks "available parallelism minus one", at least one.
    ///
    /// [`WorkerPool::from_settings`]: crate::tasks::WorkerPool::from_settings
    pub worker_threads: usize,
}

impl Default for PipelineCacheSettings {
    fn default() -> Self {
        Self {
            async_compilation: true,
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL_SECS,
            worker_threads: 0,
        }
    }
}

impl PipelineCacheSettings {
    #[must_use]
    pub fn with_async_compilation(mut self, enabled: bool) -> Self {
        self.async_compilation = enabled;
        self
    }

    #[must_use]
    pub fn with_eviction_interval_secs(mut self, secs: u32) -> Self {
        self.eviction_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// The eviction interval, or `None` when eviction is disabled.
    #[inline]
    #[must_use]
    pub fn eviction_interval(&self) -> Option<Duration> {
        (self.eviction_interval_secs > 0)
            .then(|| Duration::from_secs(u64::from(self.eviction_interval_secs)))
    }

    /// Resolved worker count (never zero).
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .saturating_sub(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_async_and_sixty_second_eviction() {
        let settings = PipelineCacheSettings::default();
        assert!(settings.async_compilation);
        assert_eq!(settings.eviction_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_interval_disables_eviction() {
        let settings = PipelineCacheSettings::default().with_eviction_interval_secs(0);
        assert_eq!(settings.eviction_interval(), None);
    }

    #[test]
    fn worker_threads_never_resolve_to_zero() {
        assert!(PipelineCacheSettings::default().resolved_worker_threads() >= 1);
        let explicit = PipelineCacheSettings::default().with_worker_threads(3);
        assert_eq!(explicit.resolved_worker_threads(), 3);
    }
}
