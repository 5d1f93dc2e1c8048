//! `wgpu` implementation of [`PipelineBackend`].
//!
//! Shaders are registered once as WGSL and addressed by the [`ShaderRef`]
//! returned from [`WgpuBackend::register_shader`]. Pipelines are created
//! with an automatic layout derived from the shader.
//!
//! Entry points follow the usual conventions: `vs_main` / `fs_main` for
//! graphics, `main` for compute.
//!
//! `wgpu` has no hull, domain or geometry stages. Keys that use them are
//! rejected with [`CompileError::Unsupported`] before reaching the device.

use std::borrow::Cow;

use log::debug;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::CompileError;
use crate::pipeline::backend::PipelineBackend;
use crate::pipeline::pipeline_key::{
    ComputePipelineKey, GraphicsPipelineKey, RenderTargetFlags, ShaderRef, ShaderStage,
};

pub const VERTEX_ENTRY_POINT: &str = "vs_main";
pub const FRAGMENT_ENTRY_POINT: &str = "fs_main";
pub const COMPUTE_ENTRY_POINT: &str = "main";

/// Compiles pipelines on a `wgpu::Device`.
pub struct WgpuBackend {
    device: wgpu::Device,
    modules: RwLock<FxHashMap<ShaderRef, wgpu::ShaderModule>>,
}

impl WgpuBackend {
    #[must_use]
    pub fn new(device: wgpu::Device) -> Self {
        Self {
            device,
            modules: RwLock::new(FxHashMap::default()),
        }
    }

    /// Compiles a WGSL module for `stage` unless identical source was
    /// registered before.
    pub fn register_shader(&self, stage: ShaderStage, label: &str, wgsl: &str) -> ShaderRef {
        let shader = ShaderRef::from_source(stage, wgsl);
        if self.modules.read().contains_key(&shader) {
            return shader;
        }

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(wgsl.to_owned())),
            });
        self.modules.write().entry(shader).or_insert(module);
        debug!("Registered {stage:?} shader '{label}'");
        shader
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn module(&self, shader: ShaderRef) -> Result<wgpu::ShaderModule, CompileError> {
        self.modules
            .read()
            .get(&shader)
            .cloned()
            .ok_or(CompileError::MissingShader(shader))
    }
}

/// Checks everything the device would otherwise report through its
/// uncaptured-error handler.
pub fn validate_graphics_key(key: &GraphicsPipelineKey) -> Result<(), CompileError> {
    let shaders = &key.shaders;
    if shaders.hull.is_some() || shaders.domain.is_some() {
        return Err(CompileError::Unsupported("tessellation stages".into()));
    }
    if shaders.geometry.is_some() {
        return Err(CompileError::Unsupported("geometry stage".into()));
    }
    if shaders.vertex.stage != ShaderStage::Vertex {
        return Err(CompileError::InvalidDescriptor(format!(
            "vertex slot holds a {:?} shader",
            shaders.vertex.stage
        )));
    }
    if let Some(pixel) = shaders.pixel
        && pixel.stage != ShaderStage::Pixel
    {
        return Err(CompileError::InvalidDescriptor(format!(
            "pixel slot holds a {:?} shader",
            pixel.stage
        )));
    }

    let targets = &key.render_targets;
    if targets.sample_count == 0 || !targets.sample_count.is_power_of_two() {
        return Err(CompileError::InvalidDescriptor(format!(
            "sample count {} is not a power of two",
            targets.sample_count
        )));
    }
    if targets.color_formats.is_empty() && targets.depth_stencil_format.is_none() {
        return Err(CompileError::InvalidDescriptor(
            "no color or depth-stencil target".into(),
        ));
    }
    if key.blend.len() != targets.color_target_count() {
        return Err(CompileError::InvalidDescriptor(format!(
            "{} blend states for {} color targets",
            key.blend.len(),
            targets.color_target_count()
        )));
    }
    Ok(())
}

/// Depth-stencil state for the key's depth target, if it has one.
///
/// Read-only depth or stencil attachments mask the matching writes.
pub fn depth_stencil_state(key: &GraphicsPipelineKey) -> Option<wgpu::DepthStencilState> {
    let flags = key.render_targets.flags;
    let format = key.render_targets.depth_stencil_format?;

    let mut stencil: wgpu::StencilState = key.depth_stencil.stencil.into();
    if flags.contains(RenderTargetFlags::READ_ONLY_STENCIL) {
        stencil.write_mask = 0;
    }

    Some(wgpu::DepthStencilState {
        format,
        depth_write_enabled: Some(
            key.depth_stencil.depth_write_enabled
                && !flags.contains(RenderTargetFlags::READ_ONLY_DEPTH),
        ),
        depth_compare: Some(key.depth_stencil.depth_compare),
        stencil,
        bias: key.rasterizer.depth_bias.into(),
    })
}

impl PipelineBackend for WgpuBackend {
    type GraphicsPipeline = wgpu::RenderPipeline;
    type ComputePipeline = wgpu::ComputePipeline;

    fn compile_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
    ) -> Result<wgpu::RenderPipeline, CompileError> {
        validate_graphics_key(key)?;

        let vertex_module = self.module(key.shaders.vertex)?;
        let fragment_module = key.shaders.pixel.map(|p| self.module(p)).transpose()?;

        let attributes: SmallVec<[Vec<wgpu::VertexAttribute>; 2]> = key
            .vertex_buffers
            .iter()
            .map(|buffer| buffer.attributes.iter().map(|&a| a.into()).collect())
            .collect();
        let vertex_buffers: SmallVec<[wgpu::VertexBufferLayout<'_>; 2]> = key
            .vertex_buffers
            .iter()
            .zip(&attributes)
            .map(|(buffer, attributes)| wgpu::VertexBufferLayout {
                array_stride: buffer.array_stride,
                step_mode: buffer.step_mode,
                attributes,
            })
            .collect();

        let color_targets: SmallVec<[Option<wgpu::ColorTargetState>; 4]> = key
            .render_targets
            .color_formats
            .iter()
            .zip(&key.blend)
            .map(|(&format, blend)| {
                let format = if key.render_targets.flags.contains(RenderTargetFlags::SRGB) {
                    format.add_srgb_suffix()
                } else {
                    format
                };
                Some(wgpu::ColorTargetState {
                    format,
                    blend: blend.blend.map(Into::into),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(blend.write_mask),
                })
            })
            .collect();

        let depth_stencil = depth_stencil_state(key);

        let label = key.debug_label();
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label.as_ref()),
                layout: None,
                vertex: wgpu::VertexState {
                    module: &vertex_module,
                    entry_point: Some(VERTEX_ENTRY_POINT),
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: fragment_module.as_ref().map(|module| wgpu::FragmentState {
                    module,
                    entry_point: Some(FRAGMENT_ENTRY_POINT),
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: key.topology,
                    strip_index_format: key.strip_index_format,
                    front_face: key.rasterizer.front_face,
                    cull_mode: key.rasterizer.cull_mode,
                    unclipped_depth: key.rasterizer.unclipped_depth,
                    polygon_mode: key.rasterizer.polygon_mode,
                    conservative: key.rasterizer.conservative,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: key.render_targets.sample_count,
                    mask: key.sample_mask,
                    alpha_to_coverage_enabled: key.alpha_to_coverage,
                },
                multiview_mask: None,
                cache: None,
            });

        debug!("Created render pipeline '{label}'");
        Ok(pipeline)
    }

    fn compile_compute_pipeline(
        &self,
        key: &ComputePipelineKey,
    ) -> Result<wgpu::ComputePipeline, CompileError> {
        if key.shader.stage != ShaderStage::Compute {
            return Err(CompileError::InvalidDescriptor(format!(
                "compute key holds a {:?} shader",
                key.shader.stage
            )));
        }
        let module = self.module(key.shader)?;

        let label = key.debug_label();
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label.as_ref()),
                layout: None,
                module: &module,
                entry_point: Some(COMPUTE_ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        debug!("Created compute pipeline '{label}'");
        Ok(pipeline)
    }
}
