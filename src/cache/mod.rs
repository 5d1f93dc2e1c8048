//! Generational pipeline caches
//!
//! - [`DiscardableKeyValueCache`]: one read/write lock over current + backfill.
//!   Used for compute pipelines.
//! - [`SharedPipelineStateCache`]: lock-light lookups with per-thread staging
//!   maps merged once per frame. Used for graphics pipelines.
//!
//! Both caches age entries the same way. A discard-and-swap evicts whatever
//! is left in *backfill*, then the *current* generation becomes the new
//! backfill. Finding a backfill entry promotes it back to current, so only
//! entries that went a whole cycle without a lookup are evicted.

pub mod discardable;
pub mod shared;

use std::sync::Arc;

pub use discardable::{CacheWriteGuard, DiscardableKeyValueCache, Lookup};
pub use shared::{ConsolidationReport, ConsolidationToken, SharedPipelineStateCache};

use crate::pipeline::state::TrackedEntry;

/// Values stored in the caches: cheap shared handles with an identity.
pub trait CacheValue: Clone + Send + Sync {
    /// `true` when both handles refer to the same entry.
    fn same_entry(&self, other: &Self) -> bool;

    /// Outstanding users of the entry. Must be zero when it is released.
    fn in_use_count(&self) -> i32;

    /// `true` while a background compile still writes into the entry.
    fn is_compile_running(&self) -> bool;
}

impl<T: TrackedEntry + Send + Sync + ?Sized> CacheValue for Arc<T> {
    #[inline]
    fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }

    #[inline]
    fn in_use_count(&self) -> i32 {
        TrackedEntry::in_use_count(&**self)
    }

    #[inline]
    fn is_compile_running(&self) -> bool {
        TrackedEntry::is_compile_running(&**self)
    }
}
