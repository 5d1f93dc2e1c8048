//! Pipeline Key Tests
//!
//! Tests for:
//! - Which fixed-function state participates in key identity
//! - Mirror-type conversions from `wgpu` descriptors
//! - Render target reconciliation
//! - Debug labels

use rustc_hash::FxHashMap;

use psocache::pipeline::pipeline_key::{
    BlendStateKey, ColorBlendKey, ComputePipelineKey, DepthBiasKey, DepthStencilStateKey,
    GraphicsPipelineKey, LoadAction, RasterizerStateKey, RenderTargetFlags, RenderTargetLayout,
    ShaderRef, ShaderSet, ShaderStage, StencilStateKey, VertexBufferKey, fx_hash_key,
};

fn base_key() -> GraphicsPipelineKey {
    let shaders = ShaderSet::new(ShaderRef::from_source(ShaderStage::Vertex, "vs_main"))
        .with_pixel(ShaderRef::from_source(ShaderStage::Pixel, "fs_main"));
    GraphicsPipelineKey::new(shaders).with_render_targets(&RenderTargetLayout::single(
        wgpu::TextureFormat::Rgba16Float,
        Some(wgpu::TextureFormat::Depth24PlusStencil8),
    ))
}

fn assert_distinct(a: &GraphicsPipelineKey, b: &GraphicsPipelineKey) {
    assert_ne!(a, b);
    assert_ne!(fx_hash_key(a), fx_hash_key(b));
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn equal_descriptors_hash_equal() {
    let a = base_key();
    let b = base_key().with_label("named");
    assert_eq!(a, b);
    assert_eq!(fx_hash_key(&a), fx_hash_key(&b));

    let mut map = FxHashMap::default();
    map.insert(a, 1);
    assert_eq!(map.get(&b), Some(&1));
}

#[test]
fn blend_state_splits_keys() {
    let opaque = base_key();
    let blended = base_key().with_blend(0, ColorBlendKey::alpha_blending());
    assert_distinct(&opaque, &blended);
}

#[test]
fn topology_and_rasterizer_split_keys() {
    let triangles = base_key();
    let lines = base_key().with_topology(wgpu::PrimitiveTopology::LineList);
    assert_distinct(&triangles, &lines);

    let no_cull = base_key().with_rasterizer(RasterizerStateKey {
        cull_mode: None,
        ..RasterizerStateKey::default()
    });
    assert_distinct(&triangles, &no_cull);
}

#[test]
fn depth_stencil_state_splits_keys() {
    let default = base_key();
    let read_only = base_key().with_depth_stencil(DepthStencilStateKey {
        depth_write_enabled: false,
        ..DepthStencilStateKey::default()
    });
    assert_distinct(&default, &read_only);
}

#[test]
fn render_target_layout_splits_keys() {
    let single = base_key();
    let msaa = base_key().with_render_targets(
        &RenderTargetLayout::single(
            wgpu::TextureFormat::Rgba16Float,
            Some(wgpu::TextureFormat::Depth24PlusStencil8),
        )
        .with_sample_count(4),
    );
    assert_distinct(&single, &msaa);

    let mut srgb_layout = RenderTargetLayout::single(
        wgpu::TextureFormat::Rgba16Float,
        Some(wgpu::TextureFormat::Depth24PlusStencil8),
    );
    srgb_layout.flags |= RenderTargetFlags::SRGB;
    assert_distinct(&single, &base_key().with_render_targets(&srgb_layout));

    let mut cleared = srgb_layout.clone();
    cleared.flags = RenderTargetFlags::empty();
    cleared.color_actions.load = LoadAction::Clear;
    assert_distinct(&single, &base_key().with_render_targets(&cleared));
}

#[test]
fn vertex_layout_splits_keys() {
    let attributes = wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2];
    let layout = wgpu::VertexBufferLayout {
        array_stride: 20,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &attributes,
    };

    let bare = base_key();
    let with_vertices = base_key().with_vertex_buffer(&layout);
    assert_distinct(&bare, &with_vertices);

    let key = VertexBufferKey::from(&layout);
    assert_eq!(key.array_stride, 20);
    assert_eq!(key.attributes.len(), 2);
    assert_eq!(key.attributes[1].offset, 12);
    assert_eq!(key.attributes[1].shader_location, 1);
}

#[test]
fn compute_key_identity_is_the_shader() {
    let shader = ShaderRef::from_source(ShaderStage::Compute, "@compute fn main() {}");
    let a = ComputePipelineKey::new(shader).with_label("a");
    let b = ComputePipelineKey::new(shader).with_label("b");
    assert_eq!(a, b);
    assert_eq!(fx_hash_key(&a), fx_hash_key(&b));

    let other = ComputePipelineKey::new(ShaderRef::from_source(ShaderStage::Compute, "other"));
    assert_ne!(a, other);
}

#[test]
fn shader_stage_is_part_of_the_reference() {
    let vertex = ShaderRef::from_source(ShaderStage::Vertex, "shared.wgsl");
    let pixel = ShaderRef::from_source(ShaderStage::Pixel, "shared.wgsl");
    assert_ne!(vertex, pixel);
    assert_eq!(
        ShaderRef::from_bytes(ShaderStage::Pixel, b"shared.wgsl"),
        pixel
    );
}

// ============================================================================
// wgpu Conversions
// ============================================================================

#[test]
fn blend_state_converts_back_to_wgpu() {
    let key = BlendStateKey::from(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING);
    assert_eq!(
        wgpu::BlendState::from(key),
        wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING
    );
}

#[test]
fn depth_bias_floats_compare_bitwise() {
    let bias = wgpu::DepthBiasState {
        constant: 2,
        slope_scale: 1.5,
        clamp: 0.0,
    };
    let key = DepthBiasKey::from(bias);
    assert_eq!(key, DepthBiasKey::from(bias));
    assert_eq!(wgpu::DepthBiasState::from(key), bias);
    assert_ne!(key, DepthBiasKey::default());
}

#[test]
fn stencil_state_converts_back_to_wgpu() {
    let stencil = wgpu::StencilState {
        front: wgpu::StencilFaceState {
            compare: wgpu::CompareFunction::Equal,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::IncrementClamp,
        },
        back: wgpu::StencilFaceState::IGNORE,
        read_mask: 0xff,
        write_mask: 0x0f,
    };
    let key = StencilStateKey::from(stencil.clone());
    assert_eq!(wgpu::StencilState::from(key), stencil);
}

// ============================================================================
// Render Targets & Labels
// ============================================================================

#[test]
fn apply_render_targets_pads_blend_with_replace() {
    let mut key = base_key().with_blend(0, ColorBlendKey::alpha_blending());
    let layout = RenderTargetLayout {
        color_formats: smallvec::smallvec![
            wgpu::TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Rgba8Unorm,
        ],
        ..RenderTargetLayout::default()
    };
    key.apply_render_targets(&layout);

    assert_eq!(key.blend.len(), 2);
    assert_eq!(key.blend[0], ColorBlendKey::alpha_blending());
    assert_eq!(key.blend[1], ColorBlendKey::REPLACE);
    assert_eq!(key.render_targets, layout);
}

#[test]
fn unlabeled_keys_get_a_hash_label() {
    let key = base_key();
    let label = key.debug_label();
    assert!(label.starts_with("graphics:"), "got {label}");

    let compute = ComputePipelineKey::new(ShaderRef::from_source(ShaderStage::Compute, "cs"));
    assert!(compute.debug_label().starts_with("compute:"));
    assert_eq!(compute.clone().with_label("blur").debug_label(), "blur");
}
