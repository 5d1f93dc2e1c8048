#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! Pipeline state object cache.
//!
//! Graphics and compute pipelines are compiled on first use, shared across
//! threads and aged out in two generations: an entry that goes a whole
//! eviction cycle without a lookup is destroyed at the next one.
//!
//! Graphics lookups never contend on a global write lock; new entries are
//! staged per thread and merged once per frame by [`PipelineStateCache::begin_frame`].

pub mod cache;
pub mod errors;
pub mod pipeline;
pub mod settings;
pub mod tasks;
pub mod utils;

pub use errors::{CompileError, PipelineError, Result};
pub use pipeline::{
    CacheStats, ComputePipelineKey, FrameReport, GraphicsPipelineKey, PipelineBackend,
    PipelineStateCache, WgpuBackend,
};
pub use settings::PipelineCacheSettings;
pub use tasks::{CommandContext, CommandList, CompletionSignal, TaskScheduler, WorkerPool};
