//! Error Types
//!
//! This module defines the error types used by the pipeline cache.
//!
//! # Overview
//!
//! Two layers of errors exist:
//! - [`CompileError`] is produced by a [`PipelineBackend`] when it fails to
//!   turn a key into a driver object. It is `Clone` because a single failed
//!   asynchronous compile is observed by every caller waiting on it.
//! - [`PipelineError`] is what the public `get_or_create_*` entry points return.
//!
//! Contract violations (concurrent consolidation, duplicate staging inserts,
//! unbalanced in-use counts) are **not** represented here. They abort via
//! `panic!` at the point of violation.
//!
//! ```rust,ignore
//! use psocache::errors::{PipelineError, Result};
//!
//! fn draw(cache: &PipelineStateCache<MyBackend>) -> Result<()> {
//!     let pso = cache.get_or_create_graphics(&key, &mut cmd)?;
//!     Ok(())
//! }
//! ```
//!
//! [`PipelineBackend`]: crate::pipeline::PipelineBackend

use thiserror::Error;

use crate::pipeline::pipeline_key::ShaderRef;

/// Failure reported by a backend while compiling a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The descriptor was rejected before reaching the driver.
    #[error("Invalid pipeline descriptor: {0}")]
    InvalidDescriptor(String),

    /// The backend cannot express a requested feature (e.g. geometry shaders).
    #[error("Unsupported pipeline feature: {0}")]
    Unsupported(String),

    /// A stage references a shader the backend has never seen.
    #[error("Shader not registered with the backend: {0:?}")]
    MissingShader(ShaderRef),

    /// Driver-level failure.
    #[error("Backend compile failure: {0}")]
    Backend(String),
}

/// The main error type for pipeline lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    // ========================================================================
    // Compilation
    // ========================================================================
    /// A synchronous compile failed. Nothing was cached; the next call retries.
    #[error("Pipeline compilation failed: {0}")]
    Compile(#[from] CompileError),

    /// A lookup hit an entry whose asynchronous compile failed.
    ///
    /// The failed entry is purged from the cache so a later call recompiles.
    #[error("Pipeline '{label}' is unavailable: {source}")]
    Unavailable {
        /// Debug label of the key that failed
        label: String,
        /// The original backend failure
        source: CompileError,
    },
}

/// Alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;
