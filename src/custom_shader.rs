//! Optional post-process stage.
//!
//! When a user pixel shader (or the builtin retro effect) is active, the cell
//! passes render into an off-screen texture and this stage draws that texture
//! to the swap chain through the user's fragment shader, with a
//! `{time, scale, resolution, background}` uniform block. Shader sources are
//! parsed and validated with naga before any pipeline is touched, so a broken
//! shader never replaces a working one.

use std::path::PathBuf;
use std::time::Instant;

use wgpu::*;

use crate::error::RenderError;
use crate::payload::{MiscSettings, RenderingPayload, UVec2, color_premultiply};
use crate::pipeline::{
    CustomUniforms, create_custom_bind_group, create_custom_bind_group_layout,
    create_custom_pipeline, create_custom_sampler, create_custom_uniform_buffer,
    create_offscreen_texture,
};

const RETRO_SHADER: &str = include_str!("shaders/retro.wgsl");

/// The post-process pipeline plus its off-screen target.
pub struct CustomShaderStage {
    pipeline: RenderPipeline,
    bind_group: BindGroup,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    uniform_buffer: Buffer,
    offscreen_view: TextureView,
    surface_format: TextureFormat,
    start_time: Instant,
    requires_continuous_redraw: bool,
    /// Present for user shaders; the builtin retro shader has no file.
    source_path: Option<PathBuf>,
}

impl CustomShaderStage {
    /// Build the stage from the frame's misc settings. Returns `Ok(None)`
    /// when no post-processing is configured. A compile failure of the user
    /// shader is returned as an error so the caller can log it, invoke the
    /// warning callback and continue without the stage.
    pub fn new(
        device: &Device,
        surface_format: TextureFormat,
        target_size: UVec2,
        misc: &MiscSettings,
    ) -> Result<Option<Self>, RenderError> {
        let (source, name, source_path) = if let Some(path) = &misc.custom_pixel_shader_path {
            let source = std::fs::read_to_string(path).map_err(|e| RenderError::ShaderFileRead {
                path: path.display().to_string(),
                source: e,
            })?;
            (source, path.display().to_string(), Some(path.clone()))
        } else if misc.use_retro_terminal_effect {
            (RETRO_SHADER.to_string(), "retro builtin".to_string(), None)
        } else {
            return Ok(None);
        };

        let module = validate_and_create(device, &source, &name)?;
        // The builtin retro shader is known not to animate.
        let requires_continuous_redraw = source_path.is_some() && wgsl_reads_time(&source);

        let bind_group_layout = create_custom_bind_group_layout(device);
        let sampler = create_custom_sampler(device);
        let uniform_buffer = create_custom_uniform_buffer(device);
        let (_, offscreen_view) =
            create_offscreen_texture(device, target_size.x, target_size.y, surface_format);
        let bind_group = create_custom_bind_group(
            device,
            &bind_group_layout,
            &offscreen_view,
            &sampler,
            &uniform_buffer,
        );
        let pipeline = create_custom_pipeline(device, surface_format, &bind_group_layout, &module);

        log::info!("custom shader active: {name} (continuous redraw: {requires_continuous_redraw})");

        Ok(Some(Self {
            pipeline,
            bind_group,
            bind_group_layout,
            sampler,
            uniform_buffer,
            offscreen_view,
            surface_format,
            start_time: Instant::now(),
            requires_continuous_redraw,
            source_path,
        }))
    }

    /// Off-screen view the cell passes render into while this stage is active.
    pub fn offscreen_view(&self) -> &TextureView {
        &self.offscreen_view
    }

    /// True when the shader reads `time` and must run every frame.
    pub fn requires_continuous_redraw(&self) -> bool {
        self.requires_continuous_redraw
    }

    /// Recreate the off-screen target after a target-size change.
    pub fn resize(&mut self, device: &Device, target_size: UVec2) {
        let (_, view) =
            create_offscreen_texture(device, target_size.x, target_size.y, self.surface_format);
        self.offscreen_view = view;
        self.bind_group = create_custom_bind_group(
            device,
            &self.bind_group_layout,
            &self.offscreen_view,
            &self.sampler,
            &self.uniform_buffer,
        );
    }

    /// Recompile the user shader from disk, swapping the pipeline only after
    /// validation and creation both succeed.
    pub fn reload(&mut self, device: &Device) -> Result<(), RenderError> {
        let Some(path) = self.source_path.clone() else {
            return Ok(());
        };
        let source = std::fs::read_to_string(&path).map_err(|e| RenderError::ShaderFileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let name = path.display().to_string();
        let module = validate_and_create(device, &source, &name)?;
        let pipeline =
            create_custom_pipeline(device, self.surface_format, &self.bind_group_layout, &module);

        self.pipeline = pipeline;
        self.requires_continuous_redraw = wgsl_reads_time(&source);
        self.start_time = Instant::now();
        log::info!("custom shader reloaded from {name}");
        Ok(())
    }

    /// Upload this frame's uniform block.
    pub fn write_uniforms(&self, queue: &Queue, p: &RenderingPayload) {
        let data = CustomUniforms {
            time: self.start_time.elapsed().as_secs_f32(),
            scale: p.font.dpi as f32 / 96.0,
            resolution: [
                (p.cell_count.x * p.font.cell_size.x) as f32,
                (p.cell_count.y * p.font.cell_size.y) as f32,
            ],
            background: color_premultiply(p.misc.background_color),
        };
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&data));
    }

    /// Draw the off-screen texture to `target` through the user shader.
    pub fn draw(&self, encoder: &mut CommandEncoder, target: &TextureView) {
        let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("custom shader pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(Color::BLACK),
                    store: StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.draw(0..4, 0..1);
    }
}

/// Parse and validate WGSL with naga, then create the shader module.
fn validate_and_create(
    device: &Device,
    source: &str,
    name: &str,
) -> Result<ShaderModule, RenderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| RenderError::WgslParse {
        name: name.to_string(),
        details: e.emit_to_string(source),
    })?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| RenderError::ShaderValidation {
        name: name.to_string(),
        details: format!("{:?}", e),
    })?;

    Ok(device.create_shader_module(ShaderModuleDescriptor {
        label: Some(name),
        source: ShaderSource::Wgsl(source.into()),
    }))
}

/// Heuristic replacement for shader reflection: does the WGSL read the `time`
/// uniform member? Field declarations (`time: f32`) don't count; member reads
/// (`uniforms.time`) do. A false positive only makes redraw conservative.
pub fn wgsl_reads_time(source: &str) -> bool {
    let stripped = strip_comments(source);
    let bytes = stripped.as_bytes();
    let mut search = 0;
    while let Some(found) = stripped[search..].find("time") {
        let start = search + found;
        let end = start + 4;
        search = end;

        let before = if start == 0 { b' ' } else { bytes[start - 1] };
        let after = *bytes.get(end).unwrap_or(&b' ');
        // Must be a standalone identifier, not part of `start_time` etc.
        if before.is_ascii_alphanumeric() || before == b'_' {
            continue;
        }
        if after.is_ascii_alphanumeric() || after == b'_' {
            continue;
        }
        // `time:` is the struct field declaration.
        let mut rest = end;
        while bytes.get(rest).is_some_and(|b| b.is_ascii_whitespace()) {
            rest += 1;
        }
        if bytes.get(rest) == Some(&b':') {
            continue;
        }
        return true;
    }
    false
}

/// Remove `//` line comments and (nested) `/* */` block comments.
fn strip_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let mut depth = 1;
            i += 2;
            while i < bytes.len() && depth > 0 {
                if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            out.push(' ');
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_alone_does_not_count_as_time_usage() {
        let source = "struct U { time: f32, scale: f32 }";
        assert!(!wgsl_reads_time(source));
    }

    #[test]
    fn member_read_counts_as_time_usage() {
        let source = "struct U { time: f32 }\nfn f() -> f32 { return uniforms.time * 2.0; }";
        assert!(wgsl_reads_time(source));
    }

    #[test]
    fn commented_usage_is_ignored() {
        let source = "struct U { time: f32 }\n// uses uniforms.time\n/* uniforms.time */";
        assert!(!wgsl_reads_time(source));
    }

    #[test]
    fn similar_identifiers_are_not_confused() {
        let source = "struct U { time: f32 }\nvar start_time: f32; var timestamp: f32;";
        assert!(!wgsl_reads_time(source));
    }

    #[test]
    fn retro_shader_does_not_animate() {
        assert!(!wgsl_reads_time(RETRO_SHADER));
    }

    #[test]
    fn retro_shader_is_valid_wgsl() {
        let module = naga::front::wgsl::parse_str(RETRO_SHADER).expect("retro shader parses");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("retro shader validates");
    }

    #[test]
    fn cell_shader_is_valid_wgsl() {
        let source = include_str!("shaders/cell.wgsl");
        let module = naga::front::wgsl::parse_str(source).expect("cell shader parses");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("cell shader validates");
    }

    #[test]
    fn blit_shader_is_valid_wgsl() {
        let source = include_str!("shaders/blit.wgsl");
        let module = naga::front::wgsl::parse_str(source).expect("blit shader parses");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("blit shader validates");
    }
}
