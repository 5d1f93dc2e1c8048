//! Backend abstraction: turns keys into driver pipeline objects.
//!
//! The cache never touches a graphics API directly. Everything it knows about
//! compilation goes through [`PipelineBackend`]; [`WgpuBackend`] is the
//! implementation shipped with the crate, tests use counting mocks.
//!
//! Implementations are called from worker threads when asynchronous
//! compilation is enabled, hence the `Send + Sync` bounds.
//!
//! [`WgpuBackend`]: super::wgpu_backend::WgpuBackend

use crate::errors::CompileError;
use crate::pipeline::pipeline_key::{ComputePipelineKey, GraphicsPipelineKey};

pub trait PipelineBackend: Send + Sync + 'static {
    /// Compiled graphics pipeline object.
    type GraphicsPipeline: Send + Sync + 'static;
    /// Compiled compute pipeline object.
    type ComputePipeline: Send + Sync + 'static;

    fn compile_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
    ) -> Result<Self::GraphicsPipeline, CompileError>;

    fn compile_compute_pipeline(
        &self,
        key: &ComputePipelineKey,
    ) -> Result<Self::ComputePipeline, CompileError>;
}
