//! Typed error types for glyphgrid.
//!
//! This module provides structured error types so callers at the crate boundary
//! can match on specific error variants instead of relying on opaque `anyhow`
//! strings. Per-frame recovery (a full glyph atlas) is handled internally and
//! never surfaces here.

use thiserror::Error;

/// Top-level error type for the renderer.
///
/// Covers the failure categories callers may want to distinguish:
/// - GPU surface / presentation
/// - Shader validation and reload
/// - Malformed per-frame payloads
/// - Unrecoverable glyph cache conditions
#[derive(Debug, Error)]
pub enum RenderError {
    /// `Surface::get_current_texture()` failed (timeout, outdated, lost, ...).
    ///
    /// The current frame is skipped; the next frame re-runs the full
    /// settings-update path.
    #[error("GPU surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),

    /// The shader source file could not be read from disk.
    #[error("Shader file read failed for '{path}': {source}")]
    ShaderFileRead {
        /// Path to the shader file that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The WGSL source could not be parsed.
    #[error("WGSL parse error for '{name}': {details}")]
    WgslParse {
        /// Shader name or path.
        name: String,
        /// Human-readable parse error details.
        details: String,
    },

    /// The shader module failed naga validation.
    #[error("Shader validation failed for '{name}': {details}")]
    ShaderValidation {
        /// Shader name or path.
        name: String,
        /// Human-readable validation error details.
        details: String,
    },

    /// A per-frame payload's parallel arrays disagree about their shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// A single glyph is larger than the entire glyph atlas can ever grow.
    ///
    /// Detected when a pack attempt fails while the atlas is empty; retrying
    /// would loop forever.
    #[error("Glyph {glyph_index} ({width}x{height} px) exceeds the maximum atlas size")]
    GlyphTooLarge {
        /// The glyph index that could not be packed.
        glyph_index: u16,
        /// Rasterized width in pixels.
        width: u32,
        /// Rasterized height in pixels.
        height: u32,
    },

    /// The injected glyph rasterizer reported a failure.
    #[error("Glyph rasterization failed: {0}")]
    Rasterizer(String),
}

/// Non-fatal conditions reported through the warning callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderWarning {
    /// The user's custom pixel shader failed to compile or validate.
    /// Rendering continues without the post-process stage.
    ShaderCompileFailed,
}
