//! Per-frame orchestration over wgpu.
//!
//! [`Renderer`] owns the injected device/queue/surface and every GPU resource
//! derived from them. `render()` runs the frame pipeline: settings-diff,
//! shader hot-reload poll, quad composition (with the atlas-full retry flush
//! wired through), resource upload, batched draws with pipeline switches at
//! blend markers, the optional post-process pass, and presentation.

use std::sync::Arc;

use wgpu::*;

use crate::atlas::GlyphAtlas;
use crate::color_bitmap::ColorBitmap;
use crate::compose::FrameComposer;
use crate::custom_shader::CustomShaderStage;
use crate::error::{RenderError, RenderWarning};
use crate::payload::{RenderingPayload, UVec2, color_premultiply};
use crate::pipeline::{self, CellUniforms};
use crate::quads::{BlendMode, DrawBatch, QuadStream};
use crate::rasterizer::GlyphRasterizer;
use crate::shader_watcher::ShaderWatcher;

/// Enhanced-contrast constants fed to the cell shader, mirroring the usual
/// rendering-parameter defaults for each antialiasing family.
const GRAYSCALE_ENHANCED_CONTRAST: f32 = 1.0;
const CLEARTYPE_ENHANCED_CONTRAST: f32 = 0.5;

/// The two cell pipelines plus their shared bind group.
struct GpuPipelines {
    default_pipeline: RenderPipeline,
    invert_pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    bind_group: Option<BindGroup>,
}

/// Shared quad geometry and the growable instance buffer.
struct GpuBuffers {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    instance_buffer: Buffer,
    /// Instances the GPU buffer can hold; grows in 64 KiB steps, never
    /// shrinks.
    instance_capacity: usize,
    uniform_buffer: Buffer,
}

/// Textures whose dimensions track the payload.
struct GpuTextures {
    atlas_texture: Texture,
    atlas_view: TextureView,
    atlas_size: UVec2,
    color_bitmap_texture: Texture,
    color_bitmap_view: TextureView,
    color_bitmap_cells: UVec2,
}

/// GPU-accelerated cell-grid renderer.
///
/// Runs on a single render thread; `render` is not reentrant. All wgpu
/// resources are exclusively owned here.
pub struct Renderer {
    device: Arc<Device>,
    queue: Arc<Queue>,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,

    pipelines: GpuPipelines,
    buffers: GpuBuffers,
    textures: GpuTextures,

    atlas: GlyphAtlas,
    composer: FrameComposer,
    quads: QuadStream,
    batches: Vec<DrawBatch>,
    color_bitmap: ColorBitmap,
    rasterizer: Box<dyn GlyphRasterizer>,
    custom_shader: Option<CustomShaderStage>,
    shader_watcher: Option<ShaderWatcher>,
    warning_callback: Option<Box<dyn Fn(RenderWarning)>>,

    generation: u64,
    font_generation: u64,
    misc_generation: u64,
    cell_count: UVec2,
    target_size: UVec2,
}

impl Renderer {
    /// Build the renderer over an injected device, queue and configured
    /// surface. The device must have been created with
    /// [`pipeline::REQUIRED_FEATURES`].
    pub fn new(
        device: Arc<Device>,
        queue: Arc<Queue>,
        surface: Surface<'static>,
        surface_config: SurfaceConfiguration,
        rasterizer: Box<dyn GlyphRasterizer>,
    ) -> Self {
        let bind_group_layout = pipeline::create_cell_bind_group_layout(&device);
        let default_pipeline = pipeline::create_cell_pipeline(
            &device,
            surface_config.format,
            &bind_group_layout,
            pipeline::DEFAULT_BLEND,
            "cell pipeline",
        );
        let invert_pipeline = pipeline::create_cell_pipeline(
            &device,
            surface_config.format,
            &bind_group_layout,
            pipeline::INVERT_BLEND,
            "cell pipeline (invert)",
        );

        let (vertex_buffer, index_buffer) = pipeline::create_quad_buffers(&device);
        let instance_size = pipeline::instance_buffer_size(1);
        let instance_buffer = pipeline::create_instance_buffer(&device, instance_size);
        let uniform_buffer = pipeline::create_cell_uniform_buffer(&device);

        // Placeholder textures keep the bind group valid until the first
        // settings update sizes the real ones.
        let (atlas_texture, atlas_view) = pipeline::create_atlas_texture(&device, 1, 1);
        let (color_bitmap_texture, color_bitmap_view) =
            pipeline::create_color_bitmap_texture(&device, 1, 1);

        let max_dimension = device.limits().max_texture_dimension_2d;

        Self {
            device,
            queue,
            surface,
            surface_config,
            pipelines: GpuPipelines {
                default_pipeline,
                invert_pipeline,
                bind_group_layout,
                bind_group: None,
            },
            buffers: GpuBuffers {
                vertex_buffer,
                index_buffer,
                instance_buffer,
                instance_capacity: (instance_size as usize)
                    / std::mem::size_of::<crate::quads::QuadInstance>(),
                uniform_buffer,
            },
            textures: GpuTextures {
                atlas_texture,
                atlas_view,
                atlas_size: UVec2::new(1, 1),
                color_bitmap_texture,
                color_bitmap_view,
                color_bitmap_cells: UVec2::new(0, 0),
            },
            atlas: GlyphAtlas::new(max_dimension),
            composer: FrameComposer::new(),
            quads: QuadStream::new(),
            batches: Vec::new(),
            color_bitmap: ColorBitmap::new(),
            rasterizer,
            custom_shader: None,
            shader_watcher: None,
            warning_callback: None,
            generation: u64::MAX,
            font_generation: u64::MAX,
            misc_generation: u64::MAX,
            cell_count: UVec2::new(0, 0),
            target_size: UVec2::new(0, 0),
        }
    }

    /// Install a callback for non-fatal conditions (shader compile failures).
    pub fn set_warning_callback(&mut self, callback: Box<dyn Fn(RenderWarning)>) {
        self.warning_callback = Some(callback);
    }

    /// True when the active custom shader animates and the caller should
    /// schedule frames continuously.
    pub fn requires_continuous_redraw(&self) -> bool {
        self.custom_shader
            .as_ref()
            .is_some_and(|s| s.requires_continuous_redraw())
    }

    /// Render one frame. Fatal errors abort the frame with nothing presented;
    /// the next call re-runs the full settings-update path.
    pub fn render(&mut self, p: &mut RenderingPayload) -> Result<(), RenderError> {
        let result = self.render_frame(p);
        if result.is_err() {
            self.generation = u64::MAX;
        }
        result
    }

    fn render_frame(&mut self, p: &mut RenderingPayload) -> Result<(), RenderError> {
        p.validate()?;

        if self.generation != p.generation {
            self.handle_settings_update(p);
        }

        self.poll_shader_reload();

        let frame = self.surface.get_current_texture()?;
        let frame_view = frame.texture.create_view(&TextureViewDescriptor::default());

        {
            let Self {
                device,
                queue,
                pipelines,
                buffers,
                textures,
                atlas,
                composer,
                quads,
                batches,
                color_bitmap,
                rasterizer,
                custom_shader,
                ..
            } = self;

            // With a custom shader the cell passes render off-screen; the
            // post-process pass owns the swap chain.
            let target_view: &TextureView = match custom_shader {
                Some(stage) => stage.offscreen_view(),
                None => &frame_view,
            };

            let mut flush = |p: &RenderingPayload, quads: &mut QuadStream, atlas: &mut GlyphAtlas| {
                flush_quads(
                    device,
                    queue,
                    pipelines,
                    buffers,
                    textures,
                    color_bitmap,
                    false,
                    p,
                    quads,
                    atlas,
                    batches,
                    target_view,
                );
            };

            composer.compose(p, atlas, rasterizer.as_mut(), quads, &mut flush)?;
            drop(flush);

            flush_quads(
                device,
                queue,
                pipelines,
                buffers,
                textures,
                color_bitmap,
                composer.skip_foreground_bitmap_upload(),
                p,
                quads,
                atlas,
                batches,
                target_view,
            );

            if let Some(stage) = custom_shader {
                stage.write_uniforms(queue, p);
                let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("custom shader encoder"),
                });
                stage.draw(&mut encoder, &frame_view);
                queue.submit(Some(encoder.finish()));

                // Per-pixel post-processing invalidates partial presentation.
                p.dirty_rect_in_px = crate::payload::Rect::new(
                    0,
                    0,
                    p.target_size.x as i32,
                    p.target_size.y as i32,
                );
            }
        }

        frame.present();
        Ok(())
    }

    fn handle_settings_update(&mut self, p: &RenderingPayload) {
        let font_changed = self.font_generation != p.font_generation;
        let misc_changed = self.misc_generation != p.misc_generation;
        let cell_count_changed = self.cell_count != p.cell_count;
        let target_changed = self.target_size != p.target_size;

        if target_changed && p.target_size.x != 0 && p.target_size.y != 0 {
            self.surface_config.width = p.target_size.x;
            self.surface_config.height = p.target_size.y;
            self.surface.configure(&self.device, &self.surface_config);
        }

        if font_changed {
            // Clearing the atlas is deferred to the next text pass so the
            // reset sizes itself against the new font metrics.
            self.composer.font_changed_reset_glyph_atlas = true;
        }

        if misc_changed {
            self.recreate_custom_shader(p);
        }

        if cell_count_changed {
            let (texture, view) = pipeline::create_color_bitmap_texture(
                &self.device,
                p.cell_count.x,
                p.cell_count.y,
            );
            self.textures.color_bitmap_texture = texture;
            self.textures.color_bitmap_view = view;
            self.textures.color_bitmap_cells = p.cell_count;
            self.color_bitmap.invalidate();
            self.pipelines.bind_group = None;
        }

        if (target_changed || misc_changed) && let Some(stage) = &mut self.custom_shader {
            stage.resize(&self.device, p.target_size);
        }

        let contrast = match p.font.antialiasing_mode {
            crate::payload::AntialiasingMode::ClearType => CLEARTYPE_ENHANCED_CONTRAST,
            _ => GRAYSCALE_ENHANCED_CONTRAST,
        };
        let uniforms = CellUniforms {
            position_scale: [
                2.0 / p.target_size.x.max(1) as f32,
                2.0 / p.target_size.y.max(1) as f32,
            ],
            cell_size: [p.font.cell_size.x as f32, p.font.cell_size.y as f32],
            cell_count: [p.cell_count.x as f32, p.cell_count.y as f32],
            enhanced_contrast: contrast,
            underline_width: p.font.underline_width as f32,
            background_color: color_premultiply(p.misc.background_color),
        };
        self.queue
            .write_buffer(&self.buffers.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        self.generation = p.generation;
        self.font_generation = p.font_generation;
        self.misc_generation = p.misc_generation;
        self.cell_count = p.cell_count;
        self.target_size = p.target_size;
    }

    fn recreate_custom_shader(&mut self, p: &RenderingPayload) {
        self.custom_shader = None;
        self.shader_watcher = None;

        match CustomShaderStage::new(
            &self.device,
            self.surface_config.format,
            p.target_size,
            &p.misc,
        ) {
            Ok(stage) => {
                self.custom_shader = stage;
                if let Some(path) = &p.misc.custom_pixel_shader_path
                    && self.custom_shader.is_some()
                {
                    match ShaderWatcher::new(path) {
                        Ok(watcher) => self.shader_watcher = Some(watcher),
                        Err(e) => log::warn!("shader hot reload unavailable: {e:#}"),
                    }
                }
            }
            Err(e) => {
                log::error!("custom shader failed to load: {e}");
                if let Some(callback) = &self.warning_callback {
                    callback(RenderWarning::ShaderCompileFailed);
                }
            }
        }
    }

    fn poll_shader_reload(&mut self) {
        let Some(watcher) = &self.shader_watcher else {
            return;
        };
        if !watcher.take_invalidation() {
            return;
        }
        if let Some(stage) = &mut self.custom_shader
            && let Err(e) = stage.reload(&self.device)
        {
            // The previous pipeline stays active; the renderer remains fully
            // functional.
            log::error!("custom shader reload failed: {e}");
            if let Some(callback) = &self.warning_callback {
                callback(RenderWarning::ShaderCompileFailed);
            }
        }
    }
}

/// Upload everything the quad stream references and issue its draw batches.
///
/// Called at end of frame and, mid-frame, when the atlas retry protocol needs
/// the pending quads drawn before the atlas resets underneath them.
#[allow(clippy::too_many_arguments)]
fn flush_quads(
    device: &Device,
    queue: &Queue,
    pipelines: &mut GpuPipelines,
    buffers: &mut GpuBuffers,
    textures: &mut GpuTextures,
    color_bitmap: &mut ColorBitmap,
    skip_foreground_bitmap_upload: bool,
    p: &RenderingPayload,
    quads: &mut QuadStream,
    atlas: &mut GlyphAtlas,
    batches: &mut Vec<DrawBatch>,
    target: &TextureView,
) {
    if quads.is_empty() {
        return;
    }

    upload_color_bitmap(queue, textures, color_bitmap, skip_foreground_bitmap_upload, p);
    upload_atlas(device, queue, textures, pipelines, atlas);

    if pipelines.bind_group.is_none() {
        pipelines.bind_group = Some(pipeline::create_cell_bind_group(
            device,
            &pipelines.bind_group_layout,
            &textures.color_bitmap_view,
            &textures.atlas_view,
            &buffers.uniform_buffer,
        ));
    }

    // Grow the instance buffer in 64 KiB steps; the viewport cell count is
    // the initial estimate.
    let needed = quads.len();
    if needed > buffers.instance_capacity {
        let minimum = (p.cell_count.x * p.cell_count.y) as usize;
        let size = pipeline::instance_buffer_size(needed.max(minimum));
        buffers.instance_buffer = pipeline::create_instance_buffer(device, size);
        buffers.instance_capacity =
            size as usize / std::mem::size_of::<crate::quads::QuadInstance>();
    }
    queue.write_buffer(
        &buffers.instance_buffer,
        0,
        bytemuck::cast_slice(quads.instances()),
    );

    quads.take_batches(batches);

    let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
        label: Some("cell encoder"),
    });
    {
        let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("cell pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: Operations {
                    // The background quad covers the frame; a mid-frame retry
                    // flush must not clear the quads drawn before it.
                    load: LoadOp::Load,
                    store: StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        pass.set_vertex_buffer(0, buffers.vertex_buffer.slice(..));
        pass.set_vertex_buffer(1, buffers.instance_buffer.slice(..));
        pass.set_index_buffer(buffers.index_buffer.slice(..), IndexFormat::Uint16);
        pass.set_bind_group(0, pipelines.bind_group.as_ref().unwrap(), &[]);

        for batch in batches.iter() {
            let pipeline = match batch.blend {
                BlendMode::Default => &pipelines.default_pipeline,
                BlendMode::Invert => &pipelines.invert_pipeline,
            };
            pass.set_pipeline(pipeline);
            pass.draw_indexed(
                0..6,
                0,
                batch.base_instance..batch.base_instance + batch.instance_count,
            );
        }
    }
    queue.submit(Some(encoder.finish()));
}

/// Copy the payload's color bitmap into its texture, honoring the payload row
/// stride, unless the generation cache says nothing changed.
fn upload_color_bitmap(
    queue: &Queue,
    textures: &GpuTextures,
    color_bitmap: &mut ColorBitmap,
    skip_foreground: bool,
    p: &RenderingPayload,
) {
    if p.cell_count != textures.color_bitmap_cells {
        return;
    }
    if !color_bitmap.needs_upload(p, skip_foreground) {
        return;
    }

    queue.write_texture(
        TexelCopyTextureInfo {
            texture: &textures.color_bitmap_texture,
            mip_level: 0,
            origin: Origin3d::ZERO,
            aspect: TextureAspect::All,
        },
        bytemuck::cast_slice(&p.color_bitmap),
        TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some((p.color_bitmap_row_stride * 4) as u32),
            rows_per_image: Some(p.cell_count.y * 2),
        },
        Extent3d {
            width: p.cell_count.x,
            height: p.cell_count.y * 2,
            depth_or_array_layers: 1,
        },
    );
    color_bitmap.mark_uploaded(p);
}

/// Recreate the atlas texture when its staging bitmap changed dimensions and
/// upload the dirty region.
fn upload_atlas(
    device: &Device,
    queue: &Queue,
    textures: &mut GpuTextures,
    pipelines: &mut GpuPipelines,
    atlas: &mut GlyphAtlas,
) {
    let size = atlas.texture_size();
    if size.x == 0 || size.y == 0 {
        return;
    }

    if size != textures.atlas_size {
        let (texture, view) = pipeline::create_atlas_texture(device, size.x, size.y);
        textures.atlas_texture = texture;
        textures.atlas_view = view;
        textures.atlas_size = size;
        pipelines.bind_group = None;
    }

    let bitmap = atlas.bitmap_mut();
    let Some((left, top, right, bottom)) = bitmap.take_dirty() else {
        return;
    };
    let width = bitmap.width();
    let offset = ((top * width + left) * 4) as u64;

    queue.write_texture(
        TexelCopyTextureInfo {
            texture: &textures.atlas_texture,
            mip_level: 0,
            origin: Origin3d {
                x: left,
                y: top,
                z: 0,
            },
            aspect: TextureAspect::All,
        },
        bitmap.pixels(),
        TexelCopyBufferLayout {
            offset,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(bottom - top),
        },
        Extent3d {
            width: right - left,
            height: bottom - top,
            depth_or_array_layers: 1,
        },
    );
}
