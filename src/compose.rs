//! Per-frame quad emission.
//!
//! [`FrameComposer`] walks the payload and appends quads in the fixed paint
//! order: background, cursor pass 1, text, gridlines, cursor pass 2,
//! selection. Text consults the glyph atlas, which may rasterize on demand;
//! when the atlas fills up mid-row the composer flushes the quads emitted so
//! far through the caller's callback (they only reference rectangles placed
//! before the failure, so they draw correctly), resets the atlas and retries
//! the interrupted glyph.

use crate::atlas::{AtlasError, FontFaceKey, GlyphAtlas};
use crate::error::RenderError;
use crate::payload::{
    CursorType, INVERT_CURSOR_COLOR, LineRendition, RenderingPayload, GridLineSet,
};
use crate::quads::{BlendMode, QuadInstance, QuadStream, ShadingType};
use crate::rasterizer::GlyphRasterizer;

/// A cursor rectangle shaped in pass 1 and replayed in pass 2.
#[derive(Debug, Clone, Copy)]
struct CursorRect {
    position: [i16; 2],
    size: [u16; 2],
    color: u32,
}

/// Flush callback invoked when the atlas fills mid-frame: upload everything
/// the stream holds and draw it before the atlas resets underneath it.
pub type FlushQuads<'a> =
    dyn FnMut(&RenderingPayload, &mut QuadStream, &mut GlyphAtlas) + 'a;

/// Emits one frame's quads in paint order.
#[derive(Default)]
pub struct FrameComposer {
    cursor_rects: Vec<CursorRect>,
    /// Set by the backend when the font generation changed; the next text
    /// pass starts from a cleared atlas.
    pub font_changed_reset_glyph_atlas: bool,
    skip_foreground_bitmap_upload: bool,
}

impl FrameComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no glyph this frame carried the ligature marker, letting the
    /// color bitmap uploader skip the foreground half.
    pub fn skip_foreground_bitmap_upload(&self) -> bool {
        self.skip_foreground_bitmap_upload
    }

    /// Emit the full frame into `quads`.
    pub fn compose(
        &mut self,
        p: &mut RenderingPayload,
        atlas: &mut GlyphAtlas,
        rasterizer: &mut dyn GlyphRasterizer,
        quads: &mut QuadStream,
        flush: &mut FlushQuads<'_>,
    ) -> Result<(), RenderError> {
        self.draw_background(p, quads);
        self.draw_cursor_part1(p, quads);
        self.draw_text(p, atlas, rasterizer, quads, flush)?;
        self.draw_gridlines(p, quads);
        self.draw_cursor_part2(p, quads);
        self.draw_selection(p, quads);
        Ok(())
    }

    fn draw_background(&mut self, p: &RenderingPayload, quads: &mut QuadStream) {
        *quads.append() = QuadInstance {
            shading_type: ShadingType::BACKGROUND.0 as u32,
            position: [0, 0],
            size: [p.target_size.x as u16, p.target_size.y as u16],
            ..Default::default()
        };
    }

    /// Shape the cursor into solid rectangles, splitting the cursor cell span
    /// into runs of equal background so the invert pre-pass can tint each run
    /// against its own backdrop.
    fn draw_cursor_part1(&mut self, p: &RenderingPayload, quads: &mut QuadStream) {
        self.cursor_rects.clear();

        if p.cursor_rect.is_empty() {
            return;
        }

        let cell = p.font.cell_size;
        let cursor_color = p.cursor.cursor_color;

        let mut x1 = p.cursor_rect.left;
        while x1 < p.cursor_rect.right {
            let x0 = x1;
            let bg = p.background_at(x1 as u32, p.cursor_rect.top as u32);
            while x1 < p.cursor_rect.right
                && p.background_at(x1 as u32, p.cursor_rect.top as u32) == bg
            {
                x1 += 1;
            }

            let base = CursorRect {
                position: [
                    (cell.x as i32 * x0) as i16,
                    (cell.y as i32 * p.cursor_rect.top) as i16,
                ],
                size: [(cell.x as i32 * (x1 - x0)) as u16, cell.y as u16],
                color: if cursor_color == INVERT_CURSOR_COLOR {
                    bg ^ 0x3f3f3f
                } else {
                    cursor_color
                },
            };

            let thin = p.font.thin_line_width as u16;
            match p.cursor.cursor_type {
                CursorType::Legacy => {
                    let height =
                        ((base.size[1] as u32 * p.cursor.height_percentage + 50) / 100) as u16;
                    let mut c = base;
                    c.position[1] += (c.size[1] - height) as i16;
                    c.size[1] = height;
                    self.cursor_rects.push(c);
                }
                CursorType::VerticalBar => {
                    let mut c = base;
                    c.size[0] = thin;
                    self.cursor_rects.push(c);
                }
                CursorType::Underscore => {
                    let mut c = base;
                    c.position[1] += p.font.underline_pos as i16;
                    c.size[1] = p.font.underline_width as u16;
                    self.cursor_rects.push(c);
                }
                CursorType::EmptyBox => {
                    let mut top = base;
                    top.size[1] = thin;
                    let mut bottom = base;
                    bottom.position[1] += (base.size[1] - thin) as i16;
                    bottom.size[1] = thin;
                    self.cursor_rects.push(top);
                    self.cursor_rects.push(bottom);
                    // Vertical edges only where the run touches the cursor
                    // extents, shortened so they don't overlap the corners.
                    if x0 == p.cursor_rect.left {
                        let mut left = base;
                        left.position[1] += thin as i16;
                        left.size[1] -= 2 * thin;
                        left.size[0] = thin;
                        self.cursor_rects.push(left);
                    }
                    if x1 == p.cursor_rect.right {
                        let mut right = base;
                        right.position[1] += thin as i16;
                        right.size[1] -= 2 * thin;
                        right.position[0] += (base.size[0] - thin) as i16;
                        right.size[0] = thin;
                        self.cursor_rects.push(right);
                    }
                }
                CursorType::FullBox => {
                    self.cursor_rects.push(base);
                }
                CursorType::DoubleUnderscore => {
                    let mut first = base;
                    first.position[1] += p.font.double_underline_pos.x as i16;
                    first.size[1] = thin;
                    let mut second = base;
                    second.position[1] += p.font.double_underline_pos.y as i16;
                    second.size[1] = thin;
                    self.cursor_rects.push(first);
                    self.cursor_rects.push(second);
                }
            }
        }

        // The inverting cursor draws its xor-tinted backdrop now, under the
        // text; pass 2 then subtracts over the glyphs with the stored white.
        if cursor_color == INVERT_CURSOR_COLOR {
            for c in &mut self.cursor_rects {
                *quads.append() = QuadInstance {
                    shading_type: ShadingType::SOLID_FILL.0 as u32,
                    position: c.position,
                    size: c.size,
                    color: c.color,
                    ..Default::default()
                };
                c.color = INVERT_CURSOR_COLOR;
            }
        }
    }

    fn draw_text(
        &mut self,
        p: &mut RenderingPayload,
        atlas: &mut GlyphAtlas,
        rasterizer: &mut dyn GlyphRasterizer,
        quads: &mut QuadStream,
        flush: &mut FlushQuads<'_>,
    ) -> Result<(), RenderError> {
        if self.font_changed_reset_glyph_atlas {
            atlas.reset(&p.font, p.target_size);
            self.font_changed_reset_glyph_atlas = false;
        }

        let mut shading_accumulator = ShadingType::DEFAULT;
        let mut dirty_top = i32::MAX;
        let mut dirty_bottom = i32::MIN;

        let cell = p.font.cell_size;

        for y in 0..p.rows.len() {
            let mut baseline_x = 0f32;
            let baseline_y = y as i32 * cell.y as i32 + p.font.baseline;
            let line_rendition = p.rows[y].line_rendition;
            // Double renditions draw glyphs twice as wide; the pen advance
            // scales before the glyph offset, which is already 2x scaled.
            let rendition_shift = (line_rendition != LineRendition::SingleWidth) as u32;

            for mapping_index in 0..p.rows[y].mappings.len() {
                let m = p.rows[y].mappings[mapping_index];
                let key = FontFaceKey {
                    font_face: m.font_face,
                    line_rendition,
                };

                let mut x = m.glyphs_from as usize;
                while x < m.glyphs_to as usize {
                    let glyph_index = p.rows[y].glyph_indices[x];
                    let glyph = match atlas.glyph(key, glyph_index, rasterizer, &p.font) {
                        Ok(glyph) => glyph,
                        Err(AtlasError::Full) => {
                            // The flushed quads reference only rectangles
                            // placed before the failure and draw correctly
                            // against the current texture contents.
                            flush(p, quads, atlas);
                            atlas.reset(&p.font, p.target_size);
                            continue;
                        }
                        Err(AtlasError::Fatal(e)) => return Err(e),
                    };

                    if glyph.shading_type != ShadingType::DEFAULT {
                        let row = &mut p.rows[y];
                        let mut l =
                            (baseline_x + row.glyph_offsets[x].advance_offset).round() as i32;
                        let t =
                            (baseline_y as f32 - row.glyph_offsets[x].ascender_offset).round()
                                as i32;

                        l <<= rendition_shift;

                        let l = l + glyph.offset[0] as i32;
                        let t = t + glyph.offset[1] as i32;

                        row.dirty_top = row.dirty_top.min(t);
                        row.dirty_bottom = row.dirty_bottom.max(t + glyph.size[1] as i32);

                        *quads.append() = QuadInstance {
                            shading_type: glyph.shading_type.0 as u32,
                            position: [l as i16, t as i16],
                            size: glyph.size,
                            texcoord: glyph.texcoord,
                            color: row.colors[x],
                        };

                        shading_accumulator.accumulate(glyph.shading_type);
                    }

                    baseline_x += p.rows[y].glyph_advances[x];
                    x += 1;
                }
            }

            if p.invalidated_rows.contains(&(y as u16)) {
                dirty_top = dirty_top.min(p.rows[y].dirty_top);
                dirty_bottom = dirty_bottom.max(p.rows[y].dirty_bottom);
            }
        }

        if dirty_top < dirty_bottom {
            p.dirty_rect_in_px.top = p.dirty_rect_in_px.top.min(dirty_top);
            p.dirty_rect_in_px.bottom = p.dirty_rect_in_px.bottom.max(dirty_bottom);
        }

        self.skip_foreground_bitmap_upload =
            !shading_accumulator.contains(ShadingType::LIGATURE_MARKER);
        Ok(())
    }

    fn draw_gridlines(&mut self, p: &RenderingPayload, quads: &mut QuadStream) {
        for (y, row) in p.rows.iter().enumerate() {
            if !row.grid_line_ranges.is_empty() {
                self.draw_gridline_row(p, y as u16, quads);
            }
        }
    }

    fn draw_gridline_row(&mut self, p: &RenderingPayload, y: u16, quads: &mut QuadStream) {
        let cell = p.font.cell_size;
        let top = (cell.y as i32 * y as i32) as i16;
        let row = &p.rows[y as usize];

        for r in &row.grid_line_ranges {
            debug_assert!(r.lines.any());

            let left = (cell.x as i32 * r.from as i32) as i16;
            let width = (cell.x * (r.to - r.from) as u32) as u16;

            let horizontal = |offset_y: i32, height: u32, quads: &mut QuadStream| {
                *quads.append() = QuadInstance {
                    shading_type: ShadingType::SOLID_FILL.0 as u32,
                    position: [left, top + offset_y as i16],
                    size: [width, height as u16],
                    color: r.color,
                    ..Default::default()
                };
            };
            let vertical = |column: i32, quads: &mut QuadStream| {
                *quads.append() = QuadInstance {
                    shading_type: ShadingType::SOLID_FILL.0 as u32,
                    position: [(column * cell.x as i32) as i16, top],
                    size: [p.font.thin_line_width as u16, cell.y as u16],
                    color: r.color,
                    ..Default::default()
                };
            };

            if r.lines.contains(GridLineSet::LEFT) {
                for i in r.from..r.to {
                    vertical(i as i32, quads);
                }
            }
            if r.lines.contains(GridLineSet::TOP) {
                horizontal(0, p.font.thin_line_width, quads);
            }
            if r.lines.contains(GridLineSet::RIGHT) {
                for i in (r.from + 1..=r.to).rev() {
                    vertical(i as i32, quads);
                }
            }
            if r.lines.contains(GridLineSet::BOTTOM) {
                horizontal(
                    cell.y as i32 - p.font.thin_line_width as i32,
                    p.font.thin_line_width,
                    quads,
                );
            }
            if r.lines.contains(GridLineSet::UNDERLINE) {
                horizontal(p.font.underline_pos, p.font.underline_width, quads);
            }
            if r.lines.contains(GridLineSet::HYPERLINK_UNDERLINE) {
                horizontal(p.font.underline_pos, p.font.underline_width, quads);
            }
            if r.lines.contains(GridLineSet::DOUBLE_UNDERLINE) {
                horizontal(p.font.double_underline_pos.x, p.font.thin_line_width, quads);
                horizontal(p.font.double_underline_pos.y, p.font.thin_line_width, quads);
            }
            if r.lines.contains(GridLineSet::STRIKETHROUGH) {
                horizontal(p.font.strikethrough_pos, p.font.strikethrough_width, quads);
            }
        }
    }

    fn draw_cursor_part2(&mut self, p: &RenderingPayload, quads: &mut QuadStream) {
        if self.cursor_rects.is_empty() {
            return;
        }

        let invert = p.cursor.cursor_color == INVERT_CURSOR_COLOR;
        if invert {
            quads.mark_state_change(BlendMode::Invert);
        }

        for c in &self.cursor_rects {
            *quads.append() = QuadInstance {
                shading_type: ShadingType::SOLID_FILL.0 as u32,
                position: c.position,
                size: c.size,
                color: c.color,
                ..Default::default()
            };
        }

        if invert {
            quads.mark_state_change(BlendMode::Default);
        }
    }

    fn draw_selection(&mut self, p: &RenderingPayload, quads: &mut QuadStream) {
        let cell = p.font.cell_size;
        let mut last_from = 0u16;
        let mut last_to = 0u16;

        for (y, row) in p.rows.iter().enumerate() {
            if row.selection_to > row.selection_from {
                // A run of rows with identical spans extends one quad
                // downwards instead of emitting per-row duplicates.
                if row.selection_from == last_from && row.selection_to == last_to {
                    quads.last_mut().size[1] += cell.y as u16;
                } else {
                    *quads.append() = QuadInstance {
                        shading_type: ShadingType::SOLID_FILL.0 as u32,
                        position: [
                            (cell.x as i32 * row.selection_from as i32) as i16,
                            (cell.y as i32 * y as i32) as i16,
                        ],
                        size: [
                            (cell.x * (row.selection_to - row.selection_from) as u32) as u16,
                            cell.y as u16,
                        ],
                        color: p.misc.selection_color,
                        ..Default::default()
                    };
                    last_from = row.selection_from;
                    last_to = row.selection_to;
                }
            }
        }
    }
}
