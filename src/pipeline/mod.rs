//! Pipeline module
//!
//! Keys, entries and compilation for pipeline state objects:
//! - [`PipelineStateCache`]: the facade (get-or-create, begin frame, clear all)
//! - [`pipeline_key`]: hashable graphics / compute keys
//! - [`state`]: cache entries and their in-use / pending-compile tracking
//! - [`PipelineBackend`]: the driver collaborator, with [`WgpuBackend`]
//! - [`compile`]: asynchronous compile jobs

pub mod backend;
pub mod cache;
pub mod compile;
pub mod pipeline_key;
pub mod state;
pub mod wgpu_backend;

pub use backend::PipelineBackend;
pub use cache::{CacheStats, ComputeEntry, FrameReport, GraphicsEntry, PipelineStateCache};
pub use compile::AsyncCompileTask;
pub use pipeline_key::{
    ColorBlendKey, ComputePipelineKey, DepthStencilStateKey, GraphicsPipelineKey,
    RasterizerStateKey, RenderTargetFlags, RenderTargetLayout, ShaderRef, ShaderSet, ShaderStage,
};
pub use state::{
    ComputePipelineState, GraphicsPipelineState, InUseGuard, PipelineState, PipelineStats,
};
pub use wgpu_backend::WgpuBackend;
