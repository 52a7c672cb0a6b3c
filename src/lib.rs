//! GPU-accelerated cell-grid text renderer with a dynamic glyph atlas.
//!
//! glyphgrid turns a per-frame logical description of a terminal screen — a
//! grid of cells with glyph indices, colors, attributes, cursor, selection
//! and gridlines — into a minimal stream of textured quads drawn in a single
//! frame. The crate provides:
//!
//! - A glyph atlas: a dynamically grown texture caching rasterized glyph
//!   bitmaps, packed with an online skyline packer and recovered through a
//!   full → flush → repack retry protocol
//! - A packed per-instance quad stream batched into indexed-instanced draws
//!   punctuated by blend-state changes
//! - Frame assembly: background, text, gridlines, two-pass (invertible)
//!   cursor and selection composition with dirty-rect accumulation
//! - An optional user post-process shader (WGSL, naga-validated, hot
//!   reloadable) with a time/resolution uniform
//!
//! Glyph shaping, terminal emulation and window/device creation happen
//! upstream; the renderer consumes a [`payload::RenderingPayload`] per frame
//! and an injected [`rasterizer::GlyphRasterizer`].

pub mod atlas;
pub mod backend;
pub mod color_bitmap;
pub mod compose;
pub mod custom_shader;
pub mod error;
pub mod packer;
pub mod payload;
pub mod pipeline;
pub mod quads;
pub mod rasterizer;
pub mod shader_watcher;

// Re-export main public types
pub use atlas::{AtlasBitmap, CachedGlyph, FontFaceKey, GlyphAtlas};
pub use backend::Renderer;
pub use compose::FrameComposer;
pub use error::{RenderError, RenderWarning};
pub use payload::{
    AntialiasingMode, CursorSettings, CursorType, FontFaceId, FontMapping, FontSettings,
    GlyphOffset, GridLineRange, GridLineSet, LineRendition, MiscSettings, Rect, RenderingPayload,
    ShapedRow, UVec2,
};
pub use quads::{BlendMode, DrawBatch, QuadInstance, QuadStream, ShadingType};
pub use rasterizer::{BlackBox, GlyphRasterizer, GlyphRun, SwashRasterizer};
