//! The glyph atlas: a dynamically grown texture caching rasterized glyphs.
//!
//! Glyph bitmaps are packed online into a CPU staging bitmap mirrored to a GPU
//! texture; placements are cached in a two-level map keyed by font face (plus
//! line rendition) and glyph index. When the packer runs out of room the
//! caller flushes the quads accumulated so far (they reference only
//! already-placed rectangles and stay valid), the atlas resets at a possibly
//! larger size, and the interrupted glyph lookup restarts from the font-face
//! level.

use std::collections::HashMap;

use crate::error::RenderError;
use crate::packer::RectPacker;
use crate::payload::{
    AntialiasingMode, FontFaceId, FontSettings, LineRendition, SOFT_FONT_GLYPH_BASE, UVec2,
};
use crate::quads::ShadingType;
use crate::rasterizer::{GlyphRasterizer, GlyphRun};

/// Smallest atlas area; a 128x128 BGRA texture is the floor below which
/// reallocation churn outweighs any memory savings.
const MIN_AREA: u32 = 128 * 128;

/// Number of printable ASCII glyphs the initial sizing reserves room for.
const PRINTABLE_ASCII: u32 = 95;

/// CPU-side BGRA8 premultiplied staging bitmap backing the atlas texture.
///
/// Rasterizers draw into it; the backend uploads the dirty region with
/// `Queue::write_texture` before any draw that samples the atlas.
pub struct AtlasBitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    /// Union of all writes since the last upload: `(left, top, right, bottom)`.
    dirty: Option<(u32, u32, u32, u32)>,
}

impl AtlasBitmap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
            dirty: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Bytes of one pixel row, for row-sliced texture uploads.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.width * 4) as usize;
        &self.pixels[start..start + self.width as usize * 4]
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize((width * height * 4) as usize, 0);
        self.mark_dirty(0, 0, width, height);
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
        self.mark_dirty(0, 0, self.width, self.height);
    }

    fn mark_dirty(&mut self, left: u32, top: u32, right: u32, bottom: u32) {
        self.dirty = Some(match self.dirty {
            None => (left, top, right, bottom),
            Some((l, t, r, b)) => (l.min(left), t.min(top), r.max(right), b.max(bottom)),
        });
    }

    /// The region written since the last call, as `(left, top, right, bottom)`.
    pub fn take_dirty(&mut self) -> Option<(u32, u32, u32, u32)> {
        self.dirty.take()
    }

    /// Copy a `w x h` BGRA8 block to `(x, y)`. Out-of-bounds rows/columns are
    /// clipped; packed rectangles normally fit exactly.
    pub fn blit(&mut self, x: i32, y: i32, w: u32, h: u32, src: &[u8]) {
        debug_assert!(x >= 0 && y >= 0);
        debug_assert!(x as u32 + w <= self.width && y as u32 + h <= self.height);
        for sy in 0..h {
            let dy = y + sy as i32;
            if dy < 0 || dy as u32 >= self.height {
                continue;
            }
            for sx in 0..w {
                let dx = x + sx as i32;
                if dx < 0 || dx as u32 >= self.width {
                    continue;
                }
                let si = ((sy * w + sx) * 4) as usize;
                let di = ((dy as u32 * self.width + dx as u32) * 4) as usize;
                self.pixels[di..di + 4].copy_from_slice(&src[si..si + 4]);
            }
        }
        let x = x.max(0) as u32;
        let y = y.max(0) as u32;
        self.mark_dirty(x, y, (x + w).min(self.width), (y + h).min(self.height));
    }

    /// Stretch-blit a small BGRA8 pattern over a destination rectangle.
    /// `smooth` selects bilinear sampling; otherwise nearest-neighbor.
    pub fn blit_scaled(
        &mut self,
        dst: (u32, u32, u32, u32),
        src: &[u8],
        src_size: (u32, u32),
        smooth: bool,
    ) {
        let (dx0, dy0, dw, dh) = dst;
        let (sw, sh) = src_size;
        if dw == 0 || dh == 0 || sw == 0 || sh == 0 {
            return;
        }
        for y in 0..dh {
            for x in 0..dw {
                let px = if smooth {
                    sample_bilinear(src, sw, sh, x, y, dw, dh)
                } else {
                    let sx = (x * sw / dw).min(sw - 1);
                    let sy = (y * sh / dh).min(sh - 1);
                    let i = ((sy * sw + sx) * 4) as usize;
                    [src[i], src[i + 1], src[i + 2], src[i + 3]]
                };
                let di = (((dy0 + y) * self.width + dx0 + x) * 4) as usize;
                self.pixels[di..di + 4].copy_from_slice(&px);
            }
        }
        self.mark_dirty(dx0, dy0, dx0 + dw, dy0 + dh);
    }
}

fn sample_bilinear(src: &[u8], sw: u32, sh: u32, x: u32, y: u32, dw: u32, dh: u32) -> [u8; 4] {
    // Texel-center mapping of the destination pixel into source space.
    let fx = ((x as f32 + 0.5) * sw as f32 / dw as f32 - 0.5).max(0.0);
    let fy = ((y as f32 + 0.5) * sh as f32 / dh as f32 - 0.5).max(0.0);
    let x0 = fx as u32;
    let y0 = fy as u32;
    let x1 = (x0 + 1).min(sw - 1);
    let y1 = (y0 + 1).min(sh - 1);
    let tx = fx - x0 as f32;
    let ty = fy - y0 as f32;

    let at = |sx: u32, sy: u32, c: usize| src[((sy * sw + sx) * 4) as usize + c] as f32;
    let mut out = [0u8; 4];
    for (c, slot) in out.iter_mut().enumerate() {
        let top = at(x0, y0, c) * (1.0 - tx) + at(x1, y0, c) * tx;
        let bottom = at(x0, y1, c) * (1.0 - tx) + at(x1, y1, c) * tx;
        *slot = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    out
}

/// Outer cache key: resolved font face plus the row's line rendition.
/// `None` selects the soft-font path. Double-height top/bottom are distinct
/// keys whose entries share one rasterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FontFaceKey {
    pub font_face: Option<FontFaceId>,
    pub line_rendition: LineRendition,
}

/// Cached placement of one rasterized glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachedGlyph {
    /// [`ShadingType::DEFAULT`] emits no quads (whitespace).
    pub shading_type: ShadingType,
    /// Ink offset from the glyph's baseline origin, in pixels.
    pub offset: [i16; 2],
    pub size: [u16; 2],
    /// Top-left of the glyph's rectangle in the atlas.
    pub texcoord: [u16; 2],
}

/// Outcome of a failed insertion.
#[derive(Debug)]
pub enum AtlasError {
    /// The packer is out of room; flush, reset, retry.
    Full,
    /// Unrecoverable (glyph larger than the atlas can grow, rasterizer
    /// failure). Aborts the frame.
    Fatal(RenderError),
}

/// The glyph atlas: staging bitmap + packer + two-level placement cache.
pub struct GlyphAtlas {
    bitmap: AtlasBitmap,
    packer: RectPacker,
    map: HashMap<FontFaceKey, HashMap<u16, CachedGlyph>>,
    /// Shading type for regular (non-color) glyphs, from the AA mode.
    text_shading_type: ShadingType,
    /// Device texture dimension limit.
    max_dimension: u32,
    /// Expanded soft-font pattern staging, reused between glyphs.
    soft_font_pixels: Vec<u8>,
}

impl GlyphAtlas {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            bitmap: AtlasBitmap::new(0, 0),
            packer: RectPacker::new(0, 0),
            map: HashMap::new(),
            text_shading_type: ShadingType::TEXT_GRAYSCALE,
            max_dimension,
            soft_font_pixels: Vec::new(),
        }
    }

    pub fn texture_size(&self) -> UVec2 {
        UVec2::new(self.bitmap.width(), self.bitmap.height())
    }

    pub fn bitmap(&self) -> &AtlasBitmap {
        &self.bitmap
    }

    pub fn bitmap_mut(&mut self) -> &mut AtlasBitmap {
        &mut self.bitmap
    }

    /// True when no glyph has been packed since the last reset. A pack
    /// failure in this state means the glyph can never fit.
    pub fn is_empty(&self) -> bool {
        self.packer.is_empty()
    }

    /// Look up a cached placement without inserting.
    pub fn peek(&self, key: FontFaceKey, glyph_index: u16) -> Option<CachedGlyph> {
        self.map.get(&key)?.get(&glyph_index).copied()
    }

    /// Iterate every cached placement, for diagnostics and tests.
    pub fn iter_glyphs(&self) -> impl Iterator<Item = (FontFaceKey, u16, CachedGlyph)> + '_ {
        self.map.iter().flat_map(|(key, glyphs)| {
            glyphs.iter().map(move |(index, entry)| (*key, *index, *entry))
        })
    }

    /// Drop every cached glyph and size the texture for the current frame.
    ///
    /// Returns `true` when the texture dimensions changed (the GPU texture and
    /// its bind group must be recreated).
    pub fn reset(&mut self, font: &FontSettings, target_size: UVec2) -> bool {
        let (u, v) = self.compute_size(font.cell_size, target_size);
        let resized = u != self.bitmap.width() || v != self.bitmap.height();

        self.text_shading_type = match font.antialiasing_mode {
            AntialiasingMode::ClearType => ShadingType::TEXT_CLEARTYPE,
            _ => ShadingType::TEXT_GRAYSCALE,
        };

        if resized {
            log::debug!("glyph atlas resized to {u}x{v}");
            self.bitmap.resize(u, v);
        } else {
            self.bitmap.clear();
        }
        self.packer.reset(u, v);
        self.map.clear();
        resized
    }

    /// Power-of-two sizing with `u = v` or `u = 2v`: covers printable ASCII
    /// from the outset, doubles on growth, and caps at 1.25x the viewport so
    /// a hot atlas can't monopolize VRAM.
    fn compute_size(&self, cell_size: UVec2, target_size: UVec2) -> (u32, u32) {
        let max_area = self.max_dimension.saturating_mul(self.max_dimension);
        let cell_area = cell_size.area().max(1);
        let target_area = target_size.area().max(MIN_AREA);

        let min_by_font = cell_area.saturating_mul(PRINTABLE_ASCII);
        let min_by_growth = self
            .packer
            .width()
            .saturating_mul(self.packer.height())
            .saturating_mul(2);
        let min = MIN_AREA.max(min_by_font).max(min_by_growth);

        let max_by_font = target_area + target_area / 4;
        let area = max_area.min(max_by_font.min(min).max(MIN_AREA));

        let index = 31 - (area - 1).leading_zeros();
        let u = 1u32 << ((index + 2) / 2);
        let v = 1u32 << ((index + 1) / 2);
        (u.min(self.max_dimension), v.min(self.max_dimension))
    }

    /// Insert-or-get the placement for `(key, glyph_index)`.
    ///
    /// A cached entry returns without touching the rasterizer. A miss
    /// rasterizes and packs; [`AtlasError::Full`] tells the caller to run the
    /// flush/reset/retry protocol.
    pub fn glyph(
        &mut self,
        key: FontFaceKey,
        glyph_index: u16,
        rasterizer: &mut dyn GlyphRasterizer,
        font: &FontSettings,
    ) -> Result<CachedGlyph, AtlasError> {
        if let Some(cached) = self.peek(key, glyph_index) {
            return Ok(cached);
        }

        let entry = match key.font_face {
            Some(_) => self.rasterize_glyph(key, glyph_index, rasterizer, font)?,
            None => self.draw_soft_font_glyph(key, glyph_index, font)?,
        };

        // Whitespace stays a single entry; only inked double-height glyphs
        // split into a top-half and a bottom-half keyed pair.
        if key.line_rendition.is_double_height() && entry.shading_type != ShadingType::DEFAULT {
            let (first, second) = Self::split_double_height_glyph(key, entry, font);
            self.map.entry(key).or_default().insert(glyph_index, first);
            let sibling = FontFaceKey {
                font_face: key.font_face,
                line_rendition: key.line_rendition.opposite_half(),
            };
            self.map
                .entry(sibling)
                .or_default()
                .insert(glyph_index, second);
            return Ok(first);
        }

        self.map.entry(key).or_default().insert(glyph_index, entry);
        Ok(entry)
    }

    fn rasterize_glyph(
        &mut self,
        key: FontFaceKey,
        glyph_index: u16,
        rasterizer: &mut dyn GlyphRasterizer,
        font: &FontSettings,
    ) -> Result<CachedGlyph, AtlasError> {
        let run = GlyphRun {
            font_face: key.font_face.unwrap(),
            glyph_index,
            font_size: font.font_size,
            line_rendition: key.line_rendition,
            antialiasing_mode: font.antialiasing_mode,
        };

        let box_ = rasterizer
            .glyph_bounds(&run)
            .map_err(AtlasError::Fatal)?;
        if box_.is_empty() {
            return Ok(CachedGlyph::default());
        }

        let (w, h) = (box_.width(), box_.height());
        let Some((x, y)) = self.packer.pack(w, h) else {
            return Err(self.pack_failure(glyph_index, w, h));
        };

        // Baseline origin such that the ink lands exactly in the packed rect.
        let origin = (x as i32 - box_.left, y as i32 - box_.top);
        let is_color = rasterizer
            .draw_glyph(&mut self.bitmap, origin, &run)
            .map_err(AtlasError::Fatal)?;

        let mut shading_type = if is_color {
            ShadingType::PASSTHROUGH
        } else {
            self.text_shading_type
        };

        // Wide glyphs whose ink overhangs the trigger margins are ligatures;
        // the marker makes the pixel shader clamp color per cell. The width
        // condition excludes diacritics, the trigger pair excludes ordinary
        // slightly-overlapping wide glyphs.
        if w >= font.cell_size.x
            && (box_.left <= font.ligature_overhang_trigger_left
                || box_.right >= font.ligature_overhang_trigger_right)
        {
            shading_type = shading_type.with(ShadingType::LIGATURE_MARKER);
        }

        Ok(CachedGlyph {
            shading_type,
            offset: [box_.left as i16, box_.top as i16],
            size: [w as u16, h as u16],
            texcoord: [x as u16, y as u16],
        })
    }

    fn draw_soft_font_glyph(
        &mut self,
        key: FontFaceKey,
        glyph_index: u16,
        font: &FontSettings,
    ) -> Result<CachedGlyph, AtlasError> {
        let mut w = font.cell_size.x;
        let mut h = font.cell_size.y;
        if key.line_rendition != LineRendition::SingleWidth {
            w *= 2;
            if key.line_rendition.is_double_height() {
                h *= 2;
            }
        }

        let Some((x, y)) = self.packer.pack(w, h) else {
            return Err(self.pack_failure(glyph_index, w, h));
        };

        // Expand the 1-bit pattern rows (MSB-left) to BGRA white-on-clear.
        let pw = font.soft_font_cell_size.x;
        let ph = font.soft_font_cell_size.y;
        let pattern_index = glyph_index.wrapping_sub(SOFT_FONT_GLYPH_BASE) as usize;
        let rows = font
            .soft_font_pattern
            .get(pattern_index * ph as usize..(pattern_index + 1) * ph as usize)
            .ok_or_else(|| {
                AtlasError::Fatal(RenderError::Rasterizer(format!(
                    "soft font glyph {glyph_index} outside the pattern table"
                )))
            })?;

        self.soft_font_pixels.clear();
        self.soft_font_pixels.reserve((pw * ph * 4) as usize);
        for &row_bits in rows {
            let mut bits = row_bits;
            for _ in 0..pw {
                let on = bits & 0x8000 != 0;
                let v = if on { 0xff } else { 0 };
                self.soft_font_pixels.extend_from_slice(&[v, v, v, v]);
                bits <<= 1;
            }
        }

        let smooth = font.antialiasing_mode != AntialiasingMode::Aliased;
        let src = std::mem::take(&mut self.soft_font_pixels);
        self.bitmap.blit_scaled((x, y, w, h), &src, (pw, ph), smooth);
        self.soft_font_pixels = src;

        let mut offset_y = -font.baseline;
        if key.line_rendition.is_double_height() {
            offset_y -= font.cell_size.y as i32;
        }

        Ok(CachedGlyph {
            shading_type: ShadingType::TEXT_GRAYSCALE,
            offset: [0, offset_y as i16],
            size: [w as u16, h as u16],
            texcoord: [x as u16, y as u16],
        })
    }

    fn pack_failure(&self, glyph_index: u16, w: u32, h: u32) -> AtlasError {
        if self.packer.is_empty() {
            // Nothing else occupies the atlas, so retrying cannot help.
            AtlasError::Fatal(RenderError::GlyphTooLarge {
                glyph_index,
                width: w,
                height: h,
            })
        } else {
            AtlasError::Full
        }
    }

    /// Split a double-height rasterization into a top-half and a bottom-half
    /// entry, one per rendition key; returns `(for_this_key, for_sibling)`.
    ///
    /// Halves with no ink (tiny diacritics confined to one half) become
    /// whitespace.
    fn split_double_height_glyph(
        key: FontFaceKey,
        mut entry: CachedGlyph,
        font: &FontSettings,
    ) -> (CachedGlyph, CachedGlyph) {
        // Twice the line height means twice the descender gap.
        entry.offset[1] -= font.descender as i16;

        let mut top = entry;
        let mut bottom = entry;

        let top_size = (-(entry.offset[1] as i32) - font.baseline)
            .clamp(0, entry.size[1] as i32) as u16;
        top.offset[1] += font.cell_size.y as i16;
        top.size[1] = top_size;
        bottom.offset[1] += top_size as i16;
        bottom.size[1] = entry.size[1].saturating_sub(top_size);
        bottom.texcoord[1] += top_size;

        if top.size[1] == 0 {
            top.shading_type = ShadingType::DEFAULT;
        }
        if bottom.size[1] == 0 {
            bottom.shading_type = ShadingType::DEFAULT;
        }

        if key.line_rendition == LineRendition::DoubleHeightTop {
            (top, bottom)
        } else {
            (bottom, top)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer::BlackBox;

    /// Rasterizer producing a fixed-size solid block for every glyph.
    struct BlockRasterizer {
        box_of: fn(u16) -> BlackBox,
        rasterize_calls: usize,
        is_color: bool,
    }

    impl BlockRasterizer {
        fn new() -> Self {
            Self {
                box_of: |_| BlackBox {
                    left: 0,
                    top: -8,
                    right: 6,
                    bottom: 2,
                },
                rasterize_calls: 0,
                is_color: false,
            }
        }
    }

    impl GlyphRasterizer for BlockRasterizer {
        fn glyph_bounds(&mut self, run: &GlyphRun) -> Result<BlackBox, RenderError> {
            Ok((self.box_of)(run.glyph_index))
        }

        fn draw_glyph(
            &mut self,
            target: &mut AtlasBitmap,
            origin: (i32, i32),
            run: &GlyphRun,
        ) -> Result<bool, RenderError> {
            self.rasterize_calls += 1;
            let box_ = (self.box_of)(run.glyph_index);
            if !box_.is_empty() {
                let pixels = vec![0xff; (box_.width() * box_.height() * 4) as usize];
                target.blit(
                    origin.0 + box_.left,
                    origin.1 + box_.top,
                    box_.width(),
                    box_.height(),
                    &pixels,
                );
            }
            Ok(self.is_color)
        }
    }

    fn test_font() -> FontSettings {
        FontSettings {
            cell_size: UVec2::new(8, 16),
            baseline: 12,
            ..Default::default()
        }
    }

    fn key(rendition: LineRendition) -> FontFaceKey {
        FontFaceKey {
            font_face: Some(FontFaceId(1)),
            line_rendition: rendition,
        }
    }

    #[test]
    fn reinsertion_is_idempotent_and_skips_the_rasterizer() {
        let mut atlas = GlyphAtlas::new(4096);
        let font = test_font();
        atlas.reset(&font, UVec2::new(640, 384));
        let mut raster = BlockRasterizer::new();

        let first = atlas
            .glyph(key(LineRendition::SingleWidth), 42, &mut raster, &font)
            .ok()
            .unwrap();
        assert_eq!(raster.rasterize_calls, 1);

        let second = atlas
            .glyph(key(LineRendition::SingleWidth), 42, &mut raster, &font)
            .ok()
            .unwrap();
        assert_eq!(raster.rasterize_calls, 1, "cache hit must not rasterize");
        assert_eq!(first, second);
    }

    #[test]
    fn whitespace_glyphs_cache_without_packing() {
        let mut atlas = GlyphAtlas::new(4096);
        let font = test_font();
        atlas.reset(&font, UVec2::new(640, 384));

        struct Whitespace;
        impl GlyphRasterizer for Whitespace {
            fn glyph_bounds(&mut self, _run: &GlyphRun) -> Result<BlackBox, RenderError> {
                Ok(BlackBox::default())
            }
            fn draw_glyph(
                &mut self,
                _target: &mut AtlasBitmap,
                _origin: (i32, i32),
                _run: &GlyphRun,
            ) -> Result<bool, RenderError> {
                panic!("whitespace must not be drawn");
            }
        }

        let entry = atlas
            .glyph(key(LineRendition::SingleWidth), 32, &mut Whitespace, &font)
            .ok()
            .unwrap();
        assert_eq!(entry.shading_type, ShadingType::DEFAULT);
        assert_eq!(entry.size, [0, 0]);
        assert!(atlas.is_empty(), "whitespace consumes no atlas area");
    }

    #[test]
    fn full_atlas_reports_retry_then_grows_on_reset() {
        let mut atlas = GlyphAtlas::new(4096);
        let font = test_font();
        atlas.reset(&font, UVec2::new(640, 384));
        let initial = atlas.texture_size();
        let mut raster = BlockRasterizer::new();
        // Each glyph index is unique so every insert packs a fresh rect.
        let mut glyph_index = 0u16;
        let full = loop {
            match atlas.glyph(
                key(LineRendition::SingleWidth),
                glyph_index,
                &mut raster,
                &font,
            ) {
                Ok(_) => glyph_index += 1,
                Err(AtlasError::Full) => break true,
                Err(AtlasError::Fatal(e)) => panic!("unexpected fatal: {e}"),
            }
        };
        assert!(full);

        atlas.reset(&font, UVec2::new(640, 384));
        let grown = atlas.texture_size();
        assert!(
            grown.area() >= initial.area() * 2,
            "reset after filling must grow: {initial:?} -> {grown:?}"
        );
        // The interrupted glyph packs fine after the reset.
        assert!(
            atlas
                .glyph(
                    key(LineRendition::SingleWidth),
                    glyph_index,
                    &mut raster,
                    &font
                )
                .is_ok()
        );
    }

    #[test]
    fn oversized_glyph_on_empty_atlas_is_fatal() {
        let mut atlas = GlyphAtlas::new(256);
        let font = test_font();
        atlas.reset(&font, UVec2::new(64, 64));

        struct Huge;
        impl GlyphRasterizer for Huge {
            fn glyph_bounds(&mut self, _run: &GlyphRun) -> Result<BlackBox, RenderError> {
                Ok(BlackBox {
                    left: 0,
                    top: 0,
                    right: 10_000,
                    bottom: 10_000,
                })
            }
            fn draw_glyph(
                &mut self,
                _target: &mut AtlasBitmap,
                _origin: (i32, i32),
                _run: &GlyphRun,
            ) -> Result<bool, RenderError> {
                Ok(false)
            }
        }

        match atlas.glyph(key(LineRendition::SingleWidth), 1, &mut Huge, &font) {
            Err(AtlasError::Fatal(RenderError::GlyphTooLarge { .. })) => {}
            _ => panic!("expected the glyph-too-large deadlock detection"),
        }
    }

    #[test]
    fn double_height_insert_creates_both_halves() {
        let mut atlas = GlyphAtlas::new(4096);
        let font = FontSettings {
            cell_size: UVec2::new(8, 16),
            baseline: 12,
            descender: 3,
            ..Default::default()
        };
        atlas.reset(&font, UVec2::new(640, 384));

        // Tall glyph spanning both halves: ink from -24 above baseline to +4.
        struct Tall;
        impl GlyphRasterizer for Tall {
            fn glyph_bounds(&mut self, _run: &GlyphRun) -> Result<BlackBox, RenderError> {
                Ok(BlackBox {
                    left: 1,
                    top: -24,
                    right: 13,
                    bottom: 4,
                })
            }
            fn draw_glyph(
                &mut self,
                target: &mut AtlasBitmap,
                origin: (i32, i32),
                _run: &GlyphRun,
            ) -> Result<bool, RenderError> {
                let pixels = vec![0xff; 12 * 28 * 4];
                target.blit(origin.0 + 1, origin.1 - 24, 12, 28, &pixels);
                Ok(false)
            }
        }

        let top_key = key(LineRendition::DoubleHeightTop);
        let top = atlas.glyph(top_key, 65, &mut Tall, &font).ok().unwrap();
        let bottom_key = key(LineRendition::DoubleHeightBottom);
        let bottom = atlas
            .peek(bottom_key, 65)
            .expect("sibling bottom entry must exist");

        assert_eq!(
            top.size[1] + bottom.size[1],
            28,
            "halves must cover the rasterized height"
        );
        assert_eq!(bottom.texcoord[1], top.texcoord[1] + top.size[1]);
        // Looking up the sibling afterwards must not re-rasterize (the entry
        // is already cached).
        let again = atlas.glyph(bottom_key, 65, &mut Tall, &font).ok().unwrap();
        assert_eq!(again, bottom);
    }

    #[test]
    fn soft_font_glyph_fills_a_cell_rect() {
        let mut atlas = GlyphAtlas::new(4096);
        let mut font = test_font();
        font.soft_font_cell_size = UVec2::new(8, 4);
        // One glyph: a full row, an empty row, repeated.
        font.soft_font_pattern = vec![0xff00, 0x0000, 0xff00, 0x0000];
        font.antialiasing_mode = AntialiasingMode::Aliased;
        atlas.reset(&font, UVec2::new(640, 384));

        let soft_key = FontFaceKey {
            font_face: None,
            line_rendition: LineRendition::SingleWidth,
        };
        let entry = atlas
            .glyph(soft_key, SOFT_FONT_GLYPH_BASE, &mut BlockRasterizer::new(), &font)
            .ok()
            .unwrap();
        assert_eq!(entry.size, [8, 16]);
        assert_eq!(entry.shading_type, ShadingType::TEXT_GRAYSCALE);
        assert_eq!(entry.offset, [0, -(font.baseline as i16)]);
    }

    #[test]
    fn atlas_sizing_is_power_of_two_with_wide_or_square_aspect() {
        let atlas = GlyphAtlas::new(16384);
        let font = UVec2::new(9, 20);
        for target in [UVec2::new(640, 480), UVec2::new(1920, 1080), UVec2::new(120, 90)] {
            let (u, v) = atlas.compute_size(font, target);
            assert!(u.is_power_of_two() && v.is_power_of_two());
            assert!(u == v || u == 2 * v, "aspect must be 1:1 or 2:1, got {u}x{v}");
            assert!(u >= v);
        }
    }
}
