//! Strongly-typed pipeline cache keys.
//!
//! `wgpu` descriptor types (`BlendState`, `StencilState`, `VertexBufferLayout`, …)
//! do not implement `Hash` / `Eq`. This module defines *mirror* types that
//! extract the fields relevant for pipeline identity and derive the correct
//! trait impls.
//!
//! Two key families are provided:
//!
//! - [`GraphicsPipelineKey`]: shader set plus every fixed-function state
//!   that changes the compiled object (blend, rasterizer, depth/stencil,
//!   vertex layout, topology, render-target layout).
//! - [`ComputePipelineKey`]: a single compute shader reference.
//!
//! Debug labels are carried on the keys but never participate in equality or
//! hashing: two keys that differ only by label resolve to the same entry.

use std::borrow::Cow;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_128;

// ─── Shader References ────────────────────────────────────────────────────────

/// Pipeline stage a shader is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Hull,
    Domain,
    Geometry,
    Compute,
}

/// Opaque, hashable reference to a shader.
///
/// The identity is the xxh3-128 hash of the shader source (or bytecode), so
/// the same source registered twice yields the same reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderRef {
    pub stage: ShaderStage,
    pub hash: u128,
}

impl ShaderRef {
    #[inline]
    #[must_use]
    pub fn new(stage: ShaderStage, hash: u128) -> Self {
        Self { stage, hash }
    }

    /// Reference derived from shader source text.
    #[must_use]
    pub fn from_source(stage: ShaderStage, source: &str) -> Self {
        Self::from_bytes(stage, source.as_bytes())
    }

    /// Reference derived from raw shader bytecode.
    #[must_use]
    pub fn from_bytes(stage: ShaderStage, bytes: &[u8]) -> Self {
        Self {
            stage,
            hash: xxh3_128(bytes),
        }
    }
}

/// The shader stages bound by a graphics pipeline. Only the vertex stage is
/// mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderSet {
    pub vertex: ShaderRef,
    pub pixel: Option<ShaderRef>,
    pub hull: Option<ShaderRef>,
    pub domain: Option<ShaderRef>,
    pub geometry: Option<ShaderRef>,
}

impl ShaderSet {
    #[must_use]
    pub fn new(vertex: ShaderRef) -> Self {
        Self {
            vertex,
            pixel: None,
            hull: None,
            domain: None,
            geometry: None,
        }
    }

    #[must_use]
    pub fn with_pixel(mut self, pixel: ShaderRef) -> Self {
        self.pixel = Some(pixel);
        self
    }

    #[must_use]
    pub fn with_tessellation(mut self, hull: ShaderRef, domain: ShaderRef) -> Self {
        self.hull = Some(hull);
        self.domain = Some(domain);
        self
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry: ShaderRef) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

// ─── Hashable Mirror Types ────────────────────────────────────────────────────

/// Hashable mirror of `wgpu::BlendComponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponentKey {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl From<wgpu::BlendComponent> for BlendComponentKey {
    fn from(b: wgpu::BlendComponent) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

impl From<BlendComponentKey> for wgpu::BlendComponent {
    fn from(b: BlendComponentKey) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

/// Hashable mirror of `wgpu::BlendState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateKey {
    pub color: BlendComponentKey,
    pub alpha: BlendComponentKey,
}

impl From<wgpu::BlendState> for BlendStateKey {
    fn from(b: wgpu::BlendState) -> Self {
        Self {
            color: b.color.into(),
            alpha: b.alpha.into(),
        }
    }
}

impl From<BlendStateKey> for wgpu::BlendState {
    fn from(b: BlendStateKey) -> Self {
        Self {
            color: b.color.into(),
            alpha: b.alpha.into(),
        }
    }
}

/// Per-render-target blend configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlendKey {
    pub blend: Option<BlendStateKey>,
    pub write_mask: u32, // wgpu::ColorWrites bits
}

impl ColorBlendKey {
    /// Blending disabled, all channels written.
    pub const REPLACE: Self = Self {
        blend: None,
        write_mask: wgpu::ColorWrites::ALL.bits(),
    };

    #[must_use]
    pub fn alpha_blending() -> Self {
        Self {
            blend: Some(wgpu::BlendState::ALPHA_BLENDING.into()),
            write_mask: wgpu::ColorWrites::ALL.bits(),
        }
    }
}

impl Default for ColorBlendKey {
    fn default() -> Self {
        Self::REPLACE
    }
}

/// Hashable mirror of `wgpu::DepthBiasState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthBiasKey {
    pub constant: i32,
    pub slope_scale_bits: u32,
    pub clamp_bits: u32,
}

impl From<wgpu::DepthBiasState> for DepthBiasKey {
    fn from(b: wgpu::DepthBiasState) -> Self {
        Self {
            constant: b.constant,
            slope_scale_bits: b.slope_scale.to_bits(),
            clamp_bits: b.clamp.to_bits(),
        }
    }
}

impl From<DepthBiasKey> for wgpu::DepthBiasState {
    fn from(b: DepthBiasKey) -> Self {
        Self {
            constant: b.constant,
            slope_scale: f32::from_bits(b.slope_scale_bits),
            clamp: f32::from_bits(b.clamp_bits),
        }
    }
}

/// Rasterizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerStateKey {
    pub cull_mode: Option<wgpu::Face>,
    pub front_face: wgpu::FrontFace,
    pub polygon_mode: wgpu::PolygonMode,
    pub unclipped_depth: bool,
    pub conservative: bool,
    pub depth_bias: DepthBiasKey,
}

impl Default for RasterizerStateKey {
    fn default() -> Self {
        Self {
            cull_mode: Some(wgpu::Face::Back),
            front_face: wgpu::FrontFace::Ccw,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
            depth_bias: DepthBiasKey::default(),
        }
    }
}

/// Hashable mirror of `wgpu::StencilFaceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceKey {
    pub compare: wgpu::CompareFunction,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
}

impl StencilFaceKey {
    pub const IGNORE: Self = Self {
        compare: wgpu::CompareFunction::Always,
        fail_op: wgpu::StencilOperation::Keep,
        depth_fail_op: wgpu::StencilOperation::Keep,
        pass_op: wgpu::StencilOperation::Keep,
    };
}

impl From<wgpu::StencilFaceState> for StencilFaceKey {
    fn from(s: wgpu::StencilFaceState) -> Self {
        Self {
            compare: s.compare,
            fail_op: s.fail_op,
            depth_fail_op: s.depth_fail_op,
            pass_op: s.pass_op,
        }
    }
}

impl From<StencilFaceKey> for wgpu::StencilFaceState {
    fn from(s: StencilFaceKey) -> Self {
        Self {
            compare: s.compare,
            fail_op: s.fail_op,
            depth_fail_op: s.depth_fail_op,
            pass_op: s.pass_op,
        }
    }
}

/// Hashable mirror of `wgpu::StencilState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilStateKey {
    pub front: StencilFaceKey,
    pub back: StencilFaceKey,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilStateKey {
    fn default() -> Self {
        Self {
            front: StencilFaceKey::IGNORE,
            back: StencilFaceKey::IGNORE,
            read_mask: 0,
            write_mask: 0,
        }
    }
}

impl From<wgpu::StencilState> for StencilStateKey {
    fn from(s: wgpu::StencilState) -> Self {
        Self {
            front: s.front.into(),
            back: s.back.into(),
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        }
    }
}

impl From<StencilStateKey> for wgpu::StencilState {
    fn from(s: StencilStateKey) -> Self {
        Self {
            front: s.front.into(),
            back: s.back.into(),
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        }
    }
}

/// Depth/stencil test state. The attachment format lives in
/// [`RenderTargetLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilStateKey {
    pub depth_write_enabled: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub stencil: StencilStateKey,
}

impl Default for DepthStencilStateKey {
    fn default() -> Self {
        Self {
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            stencil: StencilStateKey::default(),
        }
    }
}

/// Hashable mirror of `wgpu::VertexAttribute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeKey {
    pub format: wgpu::VertexFormat,
    pub offset: u64,
    pub shader_location: u32,
}

impl From<wgpu::VertexAttribute> for VertexAttributeKey {
    fn from(a: wgpu::VertexAttribute) -> Self {
        Self {
            format: a.format,
            offset: a.offset,
            shader_location: a.shader_location,
        }
    }
}

impl From<VertexAttributeKey> for wgpu::VertexAttribute {
    fn from(a: VertexAttributeKey) -> Self {
        Self {
            format: a.format,
            offset: a.offset,
            shader_location: a.shader_location,
        }
    }
}

/// Owned, hashable mirror of `wgpu::VertexBufferLayout`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferKey {
    pub array_stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: SmallVec<[VertexAttributeKey; 8]>,
}

impl From<&wgpu::VertexBufferLayout<'_>> for VertexBufferKey {
    fn from(l: &wgpu::VertexBufferLayout<'_>) -> Self {
        Self {
            array_stride: l.array_stride,
            step_mode: l.step_mode,
            attributes: l.attributes.iter().copied().map(Into::into).collect(),
        }
    }
}

// ─── Render Target Layout ─────────────────────────────────────────────────────

bitflags! {
    /// Flags that alter how color/depth targets are bound.
    ///
    /// All flags split keys. `RESOLVE` only does that: multisample resolve
    /// is chosen when the render pass is begun, not by the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderTargetFlags: u32 {
        /// Color targets use the `*Srgb` variant of their format.
        const SRGB              = 1 << 0;
        const RESOLVE           = 1 << 1;
        /// Depth writes are masked off.
        const READ_ONLY_DEPTH   = 1 << 2;
        /// Stencil writes are masked off.
        const READ_ONLY_STENCIL = 1 << 3;
    }
}

/// What happens to an attachment's contents when a pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadAction {
    #[default]
    DontCare,
    Load,
    Clear,
}

/// What happens to an attachment's contents when a pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreAction {
    #[default]
    Store,
    Discard,
}

impl From<StoreAction> for wgpu::StoreOp {
    fn from(s: StoreAction) -> Self {
        match s {
            StoreAction::Store => wgpu::StoreOp::Store,
            StoreAction::Discard => wgpu::StoreOp::Discard,
        }
    }
}

/// Load/store pair for one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttachmentActions {
    pub load: LoadAction,
    pub store: StoreAction,
}

/// The bound render targets a graphics pipeline is compiled against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetLayout {
    pub color_formats: SmallVec<[wgpu::TextureFormat; 4]>,
    pub flags: RenderTargetFlags,
    pub depth_stencil_format: Option<wgpu::TextureFormat>,
    pub sample_count: u32,
    pub color_actions: AttachmentActions,
    pub depth_actions: AttachmentActions,
    pub stencil_actions: AttachmentActions,
}

impl Default for RenderTargetLayout {
    fn default() -> Self {
        Self {
            color_formats: SmallVec::new(),
            flags: RenderTargetFlags::empty(),
            depth_stencil_format: None,
            sample_count: 1,
            color_actions: AttachmentActions::default(),
            depth_actions: AttachmentActions::default(),
            stencil_actions: AttachmentActions::default(),
        }
    }
}

impl RenderTargetLayout {
    /// Single color target, optional depth, no multisampling.
    #[must_use]
    pub fn single(
        color: wgpu::TextureFormat,
        depth_stencil: Option<wgpu::TextureFormat>,
    ) -> Self {
        Self {
            color_formats: smallvec::smallvec![color],
            depth_stencil_format: depth_stencil,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    #[inline]
    #[must_use]
    pub fn color_target_count(&self) -> usize {
        self.color_formats.len()
    }
}

// ─── Pipeline Keys ────────────────────────────────────────────────────────────

/// Cache key for graphics pipelines.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineKey {
    pub label: Option<Cow<'static, str>>,
    pub shaders: ShaderSet,
    pub vertex_buffers: SmallVec<[VertexBufferKey; 2]>,
    /// One entry per color target, see [`Self::apply_render_targets`].
    pub blend: SmallVec<[ColorBlendKey; 4]>,
    pub rasterizer: RasterizerStateKey,
    pub depth_stencil: DepthStencilStateKey,
    pub topology: wgpu::PrimitiveTopology,
    pub strip_index_format: Option<wgpu::IndexFormat>,
    pub render_targets: RenderTargetLayout,
    pub sample_mask: u64,
    pub alpha_to_coverage: bool,
}

impl GraphicsPipelineKey {
    /// Key with default fixed-function state and no render targets.
    #[must_use]
    pub fn new(shaders: ShaderSet) -> Self {
        Self {
            label: None,
            shaders,
            vertex_buffers: SmallVec::new(),
            blend: SmallVec::new(),
            rasterizer: RasterizerStateKey::default(),
            depth_stencil: DepthStencilStateKey::default(),
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            render_targets: RenderTargetLayout::default(),
            sample_mask: !0,
            alpha_to_coverage: false,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_vertex_buffer(mut self, layout: &wgpu::VertexBufferLayout<'_>) -> Self {
        self.vertex_buffers.push(layout.into());
        self
    }

    #[must_use]
    pub fn with_blend(mut self, target: usize, blend: ColorBlendKey) -> Self {
        if self.blend.len() <= target {
            self.blend.resize(target + 1, ColorBlendKey::REPLACE);
        }
        self.blend[target] = blend;
        self
    }

    #[must_use]
    pub fn with_rasterizer(mut self, rasterizer: RasterizerStateKey) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    #[must_use]
    pub fn with_depth_stencil(mut self, depth_stencil: DepthStencilStateKey) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    #[must_use]
    pub fn with_topology(mut self, topology: wgpu::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    #[must_use]
    pub fn with_render_targets(mut self, targets: &RenderTargetLayout) -> Self {
        self.apply_render_targets(targets);
        self
    }

    /// Resolves the currently bound render targets into the key.
    ///
    /// The blend array is resized to the color target count: missing entries
    /// become [`ColorBlendKey::REPLACE`], surplus entries are dropped so that
    /// stale state for unbound targets never splits the cache.
    pub fn apply_render_targets(&mut self, targets: &RenderTargetLayout) {
        self.render_targets.clone_from(targets);
        self.blend
            .resize(targets.color_target_count(), ColorBlendKey::REPLACE);
    }

    /// Human readable name used in logs and error messages.
    #[must_use]
    pub fn debug_label(&self) -> Cow<'_, str> {
        match &self.label {
            Some(label) => Cow::Borrowed(label.as_ref()),
            None => Cow::Owned(format!("graphics:{:016x}", fx_hash_key(self))),
        }
    }
}

impl PartialEq for GraphicsPipelineKey {
    fn eq(&self, other: &Self) -> bool {
        self.shaders == other.shaders
            && self.vertex_buffers == other.vertex_buffers
            && self.blend == other.blend
            && self.rasterizer == other.rasterizer
            && self.depth_stencil == other.depth_stencil
            && self.topology == other.topology
            && self.strip_index_format == other.strip_index_format
            && self.render_targets == other.render_targets
            && self.sample_mask == other.sample_mask
            && self.alpha_to_coverage == other.alpha_to_coverage
    }
}

impl Eq for GraphicsPipelineKey {}

impl Hash for GraphicsPipelineKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shaders.hash(state);
        self.vertex_buffers.hash(state);
        self.blend.hash(state);
        self.rasterizer.hash(state);
        self.depth_stencil.hash(state);
        self.topology.hash(state);
        self.strip_index_format.hash(state);
        self.render_targets.hash(state);
        self.sample_mask.hash(state);
        self.alpha_to_coverage.hash(state);
    }
}

/// Cache key for compute pipelines.
#[derive(Debug, Clone)]
pub struct ComputePipelineKey {
    pub label: Option<Cow<'static, str>>,
    pub shader: ShaderRef,
}

impl ComputePipelineKey {
    #[must_use]
    pub fn new(shader: ShaderRef) -> Self {
        debug_assert_eq!(shader.stage, ShaderStage::Compute);
        Self {
            label: None,
            shader,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn debug_label(&self) -> Cow<'_, str> {
        match &self.label {
            Some(label) => Cow::Borrowed(label.as_ref()),
            None => Cow::Owned(format!("compute:{:032x}", self.shader.hash)),
        }
    }
}

impl PartialEq for ComputePipelineKey {
    fn eq(&self, other: &Self) -> bool {
        self.shader == other.shader
    }
}

impl Eq for ComputePipelineKey {}

impl Hash for ComputePipelineKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shader.hash(state);
    }
}

// ─── Convenience helpers ──────────────────────────────────────────────────────

/// Compute a `u64` hash of any `Hash`-able value using `FxHasher`.
#[inline]
pub fn fx_hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
