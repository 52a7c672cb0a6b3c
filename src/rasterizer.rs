//! Glyph rasterization seam.
//!
//! The atlas talks to fonts exclusively through [`GlyphRasterizer`]: measure a
//! glyph run's black box, then draw it into a caller-chosen spot of the atlas
//! staging bitmap. The production implementation is backed by swash; tests
//! inject synthetic rasterizers.

use crate::atlas::AtlasBitmap;
use crate::error::RenderError;
use crate::payload::{AntialiasingMode, FontFaceId, LineRendition};

/// A single-glyph run, pre-positioned by the shaping layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlyphRun {
    pub font_face: FontFaceId,
    pub glyph_index: u16,
    /// Em size in pixels.
    pub font_size: f32,
    /// Double-width/height renditions draw scaled 2x on the respective axes.
    pub line_rendition: LineRendition,
    pub antialiasing_mode: AntialiasingMode,
}

/// Tight integer bounds of a glyph's ink relative to its baseline origin.
/// y grows downward, so `top` is usually negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlackBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BlackBox {
    /// Whitespace glyphs report an empty box and are cached without pixels.
    pub const fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub const fn width(&self) -> u32 {
        (self.right - self.left) as u32
    }

    pub const fn height(&self) -> u32 {
        (self.bottom - self.top) as u32
    }
}

/// Draws antialiased glyph runs into the atlas staging bitmap.
///
/// `glyph_bounds` followed by `draw_glyph` for the same run must agree: the
/// ink drawn with its baseline origin at `origin` covers exactly
/// `origin + black box`.
pub trait GlyphRasterizer {
    /// World-space black box of the run, or an empty box for whitespace.
    fn glyph_bounds(&mut self, run: &GlyphRun) -> Result<BlackBox, RenderError>;

    /// Draw the run with its baseline origin at `origin` (atlas pixels).
    /// Returns `true` when the glyph supplied its own colors (color emoji),
    /// which bypasses foreground tinting.
    fn draw_glyph(
        &mut self,
        target: &mut AtlasBitmap,
        origin: (i32, i32),
        run: &GlyphRun,
    ) -> Result<bool, RenderError>;
}

/// A rasterized glyph held between the bounds query and the draw.
struct RenderedGlyph {
    run: GlyphRun,
    box_: BlackBox,
    /// BGRA8 premultiplied, `box_.width() * box_.height()` pixels.
    pixels: Vec<u8>,
    is_color: bool,
}

/// Production rasterizer backed by swash.
///
/// Font data is registered up front; the returned [`FontFaceId`]s are what the
/// shaping layer puts into payload mappings.
pub struct SwashRasterizer {
    context: swash::scale::ScaleContext,
    fonts: Vec<(Vec<u8>, u32)>,
    hint: bool,
    /// Bounds and draw of the same run share one rasterization.
    last: Option<RenderedGlyph>,
}

impl SwashRasterizer {
    pub fn new(hint: bool) -> Self {
        Self {
            context: swash::scale::ScaleContext::new(),
            fonts: Vec::new(),
            hint,
            last: None,
        }
    }

    /// Register a font's raw data; `index` selects the face in a collection.
    pub fn register_font(&mut self, data: Vec<u8>, index: u32) -> Option<FontFaceId> {
        // Validate eagerly so rasterization can't hit unparsable data later.
        swash::FontRef::from_index(&data, index as usize)?;
        let id = FontFaceId(self.fonts.len() as u64);
        self.fonts.push((data, index));
        Some(id)
    }

    fn render(&mut self, run: &GlyphRun) -> Result<&RenderedGlyph, RenderError> {
        if self.last.as_ref().is_none_or(|g| g.run != *run) {
            let Self {
                context,
                fonts,
                hint,
                ..
            } = self;

            let (data, index) = fonts.get(run.font_face.0 as usize).ok_or_else(|| {
                RenderError::Rasterizer(format!("unknown font face {:?}", run.font_face))
            })?;
            let font = swash::FontRef::from_index(data, *index as usize)
                .ok_or_else(|| RenderError::Rasterizer("font data unreadable".into()))?;

            // Double-height doubles both axes (the glyph spans two cell rows);
            // double-width only doubles x, applied as a post-scale below.
            let size_scale = if run.line_rendition.is_double_height() {
                2.0
            } else {
                1.0
            };
            let hscale_only = run.line_rendition == LineRendition::DoubleWidth;

            use swash::scale::image::Content;
            use swash::scale::{Render, Source, StrikeWith};
            use swash::zeno::Format;

            let mut scaler = context
                .builder(font)
                .size(run.font_size * size_scale)
                .hint(*hint)
                .build();

            let format = match run.antialiasing_mode {
                AntialiasingMode::ClearType => Format::Subpixel,
                _ => Format::Alpha,
            };

            let sources = [
                Source::ColorBitmap(StrikeWith::BestFit),
                Source::ColorOutline(0),
                Source::Outline,
            ];

            // A glyph swash can't render at all is treated as whitespace, the
            // same as one whose ink is empty.
            let rendered = match Render::new(&sources)
                .format(format)
                .render(&mut scaler, run.glyph_index)
            {
                None => RenderedGlyph {
                    run: *run,
                    box_: BlackBox::default(),
                    pixels: Vec::new(),
                    is_color: false,
                },
                Some(image) => {
                    let width = image.placement.width as usize;
                    let height = image.placement.height as usize;
                    let aliased = run.antialiasing_mode == AntialiasingMode::Aliased;

                    let (mut pixels, is_color) = match image.content {
                        Content::Color => (premultiply_rgba_to_bgra(&image.data), true),
                        Content::Mask => (expand_alpha_mask(&image.data, aliased), false),
                        Content::SubpixelMask => {
                            (expand_subpixel_mask(&image.data, width, height), false)
                        }
                    };

                    let mut box_ = BlackBox {
                        left: image.placement.left,
                        top: -image.placement.top,
                        right: image.placement.left + image.placement.width as i32,
                        bottom: -image.placement.top + image.placement.height as i32,
                    };

                    if hscale_only && !box_.is_empty() {
                        pixels = stretch_rows_x2(&pixels, width, height);
                        box_.left *= 2;
                        box_.right = box_.left + 2 * width as i32;
                    }

                    RenderedGlyph {
                        run: *run,
                        box_,
                        pixels,
                        is_color,
                    }
                }
            };

            self.last = Some(rendered);
        }
        Ok(self.last.as_ref().unwrap())
    }
}

impl GlyphRasterizer for SwashRasterizer {
    fn glyph_bounds(&mut self, run: &GlyphRun) -> Result<BlackBox, RenderError> {
        Ok(self.render(run)?.box_)
    }

    fn draw_glyph(
        &mut self,
        target: &mut AtlasBitmap,
        origin: (i32, i32),
        run: &GlyphRun,
    ) -> Result<bool, RenderError> {
        let glyph = self.render(run)?;
        let box_ = glyph.box_;
        if !box_.is_empty() {
            target.blit(
                origin.0 + box_.left,
                origin.1 + box_.top,
                box_.width(),
                box_.height(),
                &glyph.pixels,
            );
        }
        Ok(glyph.is_color)
    }
}

/// Expand a coverage mask to premultiplied white BGRA. Aliased rendering
/// thresholds the coverage for crisp edges.
fn expand_alpha_mask(mask: &[u8], aliased: bool) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(mask.len() * 4);
    for &coverage in mask {
        let a = if aliased {
            if coverage > 127 { 255 } else { 0 }
        } else {
            coverage
        };
        pixels.extend_from_slice(&[a, a, a, a]);
    }
    pixels
}

/// Pack subpixel RGB weights into BGRA; alpha is the peak weight so the
/// dual-source blend has a sensible coverage term.
fn expand_subpixel_mask(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let stride = if width > 0 && height > 0 {
        data.len() / (width * height)
    } else {
        0
    };
    let mut pixels = Vec::with_capacity(width * height * 4);
    match stride {
        3 | 4 => {
            for chunk in data.chunks_exact(stride) {
                let (r, g, b) = (chunk[0], chunk[1], chunk[2]);
                pixels.extend_from_slice(&[b, g, r, r.max(g).max(b)]);
            }
        }
        _ => pixels.resize(width * height * 4, 255),
    }
    pixels
}

/// Straight-alpha RGBA (swash color output) to premultiplied BGRA.
fn premultiply_rgba_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(4) {
        let a = chunk[3] as u32;
        let mul = |c: u8| ((c as u32 * a + 127) / 255) as u8;
        pixels.extend_from_slice(&[mul(chunk[2]), mul(chunk[1]), mul(chunk[0]), chunk[3]]);
    }
    pixels
}

/// Nearest-neighbor horizontal 2x stretch for double-width renditions.
fn stretch_rows_x2(pixels: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() * 2);
    for y in 0..height {
        let row = &pixels[y * width * 4..(y + 1) * width * 4];
        for px in row.chunks_exact(4) {
            out.extend_from_slice(px);
            out.extend_from_slice(px);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_black_box_detection() {
        assert!(BlackBox::default().is_empty());
        let b = BlackBox {
            left: -1,
            top: -7,
            right: 14,
            bottom: 2,
        };
        assert!(!b.is_empty());
        assert_eq!(b.width(), 15);
        assert_eq!(b.height(), 9);
    }

    #[test]
    fn alpha_mask_expansion_thresholds_when_aliased() {
        let smooth = expand_alpha_mask(&[0, 100, 255], false);
        assert_eq!(&smooth[4..8], &[100, 100, 100, 100]);
        let crisp = expand_alpha_mask(&[0, 100, 255], true);
        assert_eq!(&crisp[4..8], &[0, 0, 0, 0]);
        assert_eq!(&crisp[8..12], &[255, 255, 255, 255]);
    }

    #[test]
    fn color_pixels_are_premultiplied_and_swizzled() {
        // One straight-alpha RGBA pixel: red at half alpha.
        let out = premultiply_rgba_to_bgra(&[255, 0, 0, 128]);
        assert_eq!(out[0], 0); // b
        assert_eq!(out[1], 0); // g
        assert_eq!(out[2], 128); // r * a
        assert_eq!(out[3], 128);
    }

    #[test]
    fn horizontal_stretch_duplicates_columns() {
        // 2x1 image: pixel A then pixel B.
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let out = stretch_rows_x2(&src, 2, 1);
        assert_eq!(out, vec![1, 2, 3, 4, 1, 2, 3, 4, 5, 6, 7, 8, 5, 6, 7, 8]);
    }
}
