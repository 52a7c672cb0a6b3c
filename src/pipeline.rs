//! GPU pipeline and buffer creation.
//!
//! This module contains functions for creating the wgpu render pipelines,
//! bind groups and shared buffers used by the cell renderer: the dual-source
//! cell pipeline (default and invert blend variants), the quad vertex/index
//! pair, the rounded-up dynamic instance buffer and the post-process
//! pipeline for custom shaders.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;
use wgpu::*;

use crate::quads::QuadInstance;

/// Features the renderer needs from the injected device.
pub const REQUIRED_FEATURES: Features = Features::DUAL_SOURCE_BLENDING;

/// Instance buffer capacity is allocated in multiples of 64 KiB so resizes
/// are rare and allocation-friendly.
const INSTANCE_BUFFER_GRANULARITY: u64 = 0x10000;

/// Default dual-source blend: `src + dst * (1 - src1)`.
///
/// Source-over for solid and passthrough quads (whose weights output equals
/// their alpha) and the ClearType weighted lerp for text, whose pixel shader
/// pre-multiplies the foreground by the per-channel weights.
pub const DEFAULT_BLEND: BlendState = BlendState {
    color: BlendComponent {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::OneMinusSrc1,
        operation: BlendOperation::Add,
    },
    alpha: BlendComponent {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::OneMinusSrc1Alpha,
        operation: BlendOperation::Add,
    },
};

/// Invert blend for the inverting cursor: `src - dst` with a white source
/// yields `1 - dst`. The alpha component still references source 1 so the
/// dual-source shader output stays compatible with the pipeline.
pub const INVERT_BLEND: BlendState = BlendState {
    color: BlendComponent {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::One,
        operation: BlendOperation::Subtract,
    },
    alpha: BlendComponent {
        src_factor: BlendFactor::Src1Alpha,
        dst_factor: BlendFactor::Zero,
        operation: BlendOperation::Add,
    },
};

/// Uniform block of the cell shader. Layout mirrors `shaders/cell.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct CellUniforms {
    /// `2 / target_size`; the vertex shader flips y.
    pub position_scale: [f32; 2],
    pub cell_size: [f32; 2],
    pub cell_count: [f32; 2],
    pub enhanced_contrast: f32,
    pub underline_width: f32,
    /// Premultiplied.
    pub background_color: [f32; 4],
}

const _: () = assert!(std::mem::size_of::<CellUniforms>() == 48);

/// Uniform block of the post-process stage. Layout mirrors
/// `shaders/blit.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct CustomUniforms {
    /// Seconds since the shader was (re)loaded.
    pub time: f32,
    /// `dpi / 96`.
    pub scale: f32,
    /// Cell grid resolution in pixels.
    pub resolution: [f32; 2],
    /// Premultiplied.
    pub background: [f32; 4],
}

const _: () = assert!(std::mem::size_of::<CustomUniforms>() == 32);

/// Create the bind group layout shared by both cell pipelines: the color
/// bitmap, the glyph atlas and the uniform block. Both textures are read
/// with `textureLoad`, so no samplers are bound.
pub fn create_cell_bind_group_layout(device: &Device) -> BindGroupLayout {
    let texture_entry = |binding| BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: false },
            view_dimension: TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };
    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("cell bind group layout"),
        entries: &[
            texture_entry(0),
            texture_entry(1),
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStages::VERTEX_FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}

pub fn create_cell_bind_group(
    device: &Device,
    layout: &BindGroupLayout,
    color_bitmap_view: &TextureView,
    atlas_view: &TextureView,
    uniform_buffer: &Buffer,
) -> BindGroup {
    device.create_bind_group(&BindGroupDescriptor {
        label: Some("cell bind group"),
        layout,
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(color_bitmap_view),
            },
            BindGroupEntry {
                binding: 1,
                resource: BindingResource::TextureView(atlas_view),
            },
            BindGroupEntry {
                binding: 2,
                resource: uniform_buffer.as_entire_binding(),
            },
        ],
    })
}

/// Create one cell pipeline with the given blend state. Two variants exist
/// because blend state is baked into wgpu pipelines; a blend-state marker in
/// the quad stream becomes a pipeline switch.
pub fn create_cell_pipeline(
    device: &Device,
    surface_format: TextureFormat,
    layout: &BindGroupLayout,
    blend: BlendState,
    label: &str,
) -> RenderPipeline {
    let shader = device.create_shader_module(include_wgsl!("shaders/cell.wgsl"));

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("cell pipeline layout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[
                VertexBufferLayout {
                    array_stride: std::mem::size_of::<[f32; 2]>() as BufferAddress,
                    step_mode: VertexStepMode::Vertex,
                    attributes: &vertex_attr_array![0 => Float32x2],
                },
                VertexBufferLayout {
                    array_stride: std::mem::size_of::<QuadInstance>() as BufferAddress,
                    step_mode: VertexStepMode::Instance,
                    attributes: &vertex_attr_array![
                        1 => Uint32,
                        2 => Sint16x2,
                        3 => Uint16x2,
                        4 => Uint16x2,
                        5 => Unorm8x4
                    ],
                },
            ],
        },
        fragment: Some(FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(ColorTargetState {
                format: surface_format,
                blend: Some(blend),
                write_mask: ColorWrites::ALL,
            })],
        }),
        primitive: PrimitiveState {
            topology: PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// The shared unit quad: 4 corners and the 6 indices `{0,1,2, 2,3,0}`.
pub fn create_quad_buffers(device: &Device) -> (Buffer, Buffer) {
    const VERTICES: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    const INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

    let vertex = device.create_buffer_init(&util::BufferInitDescriptor {
        label: Some("quad vertex buffer"),
        contents: bytemuck::cast_slice(&VERTICES),
        usage: BufferUsages::VERTEX,
    });
    let index = device.create_buffer_init(&util::BufferInitDescriptor {
        label: Some("quad index buffer"),
        contents: bytemuck::cast_slice(&INDICES),
        usage: BufferUsages::INDEX,
    });
    (vertex, index)
}

/// Byte size of an instance buffer able to hold `instances`, rounded up to
/// the 64 KiB granularity.
pub fn instance_buffer_size(instances: usize) -> u64 {
    let bytes = (instances * std::mem::size_of::<QuadInstance>()) as u64;
    (bytes + INSTANCE_BUFFER_GRANULARITY - 1) & !(INSTANCE_BUFFER_GRANULARITY - 1)
}

pub fn create_instance_buffer(device: &Device, size: u64) -> Buffer {
    device.create_buffer(&BufferDescriptor {
        label: Some("quad instance buffer"),
        size,
        usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

pub fn create_cell_uniform_buffer(device: &Device) -> Buffer {
    device.create_buffer(&BufferDescriptor {
        label: Some("cell uniform buffer"),
        size: std::mem::size_of::<CellUniforms>() as u64,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// BGRA8 texture the rasterized glyph atlas staging bitmap uploads into.
pub fn create_atlas_texture(device: &Device, width: u32, height: u32) -> (Texture, TextureView) {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some("glyph atlas"),
        size: Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format: TextureFormat::Bgra8Unorm,
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    (texture, view)
}

/// Color bitmap texture: background rows stacked above foreground rows.
pub fn create_color_bitmap_texture(
    device: &Device,
    cell_count_x: u32,
    cell_count_y: u32,
) -> (Texture, TextureView) {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some("color bitmap"),
        size: Extent3d {
            width: cell_count_x.max(1),
            height: (cell_count_y * 2).max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format: TextureFormat::Rgba8Unorm,
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    (texture, view)
}

/// Off-screen target the cell passes render into when a custom shader is
/// active; the post-process pass then samples it.
pub fn create_offscreen_texture(
    device: &Device,
    width: u32,
    height: u32,
    format: TextureFormat,
) -> (Texture, TextureView) {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some("custom shader offscreen"),
        size: Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    (texture, view)
}

pub fn create_custom_bind_group_layout(device: &Device) -> BindGroupLayout {
    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("custom shader bind group layout"),
        entries: &[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    view_dimension: TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Sampler(SamplerBindingType::Filtering),
                count: None,
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}

pub fn create_custom_bind_group(
    device: &Device,
    layout: &BindGroupLayout,
    offscreen_view: &TextureView,
    sampler: &Sampler,
    uniform_buffer: &Buffer,
) -> BindGroup {
    device.create_bind_group(&BindGroupDescriptor {
        label: Some("custom shader bind group"),
        layout,
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(offscreen_view),
            },
            BindGroupEntry {
                binding: 1,
                resource: BindingResource::Sampler(sampler),
            },
            BindGroupEntry {
                binding: 2,
                resource: uniform_buffer.as_entire_binding(),
            },
        ],
    })
}

pub fn create_custom_sampler(device: &Device) -> Sampler {
    device.create_sampler(&SamplerDescriptor {
        label: Some("custom shader sampler"),
        address_mode_u: AddressMode::ClampToEdge,
        address_mode_v: AddressMode::ClampToEdge,
        address_mode_w: AddressMode::ClampToEdge,
        mag_filter: FilterMode::Linear,
        min_filter: FilterMode::Linear,
        mipmap_filter: FilterMode::Nearest,
        ..Default::default()
    })
}

pub fn create_custom_uniform_buffer(device: &Device) -> Buffer {
    device.create_buffer(&BufferDescriptor {
        label: Some("custom shader uniforms"),
        size: std::mem::size_of::<CustomUniforms>() as u64,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Build the post-process pipeline from an already-validated fragment module.
/// The vertex stage always comes from the builtin blit shader.
pub fn create_custom_pipeline(
    device: &Device,
    surface_format: TextureFormat,
    layout: &BindGroupLayout,
    fragment_module: &ShaderModule,
) -> RenderPipeline {
    let vs = device.create_shader_module(include_wgsl!("shaders/blit.wgsl"));

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("custom shader pipeline layout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some("custom shader pipeline"),
        layout: Some(&pipeline_layout),
        vertex: VertexState {
            module: &vs,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        fragment: Some(FragmentState {
            module: fragment_module,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(ColorTargetState {
                format: surface_format,
                blend: None,
                write_mask: ColorWrites::ALL,
            })],
        }),
        primitive: PrimitiveState {
            topology: PrimitiveTopology::TriangleStrip,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_buffer_sizes_round_to_64k() {
        assert_eq!(instance_buffer_size(1), 0x10000);
        assert_eq!(instance_buffer_size(0x10000 / 20), 0x10000);
        assert_eq!(instance_buffer_size(0x10000 / 20 + 1), 0x20000);
    }

    #[test]
    fn uniform_blocks_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<CellUniforms>(), 48);
        assert_eq!(std::mem::size_of::<CustomUniforms>(), 32);
    }
}
