//! End-to-end frame composition scenarios, driven entirely on the CPU with a
//! synthetic rasterizer: quad ordering, cursor passes, the atlas retry
//! protocol, dirty-rect accumulation and double-height rendering.

use glyphgrid::atlas::{AtlasBitmap, AtlasError, FontFaceKey, GlyphAtlas};
use glyphgrid::compose::FrameComposer;
use glyphgrid::error::RenderError;
use glyphgrid::payload::{
    AntialiasingMode, CursorType, FontFaceId, FontMapping, FontSettings, GlyphOffset,
    GridLineRange, GridLineSet, INVERT_CURSOR_COLOR, LineRendition, Rect, RenderingPayload,
    ShapedRow, UVec2,
};
use glyphgrid::quads::{BlendMode, QuadInstance, QuadStream, ShadingType};
use glyphgrid::rasterizer::{BlackBox, GlyphRasterizer, GlyphRun};

const CELL_W: u32 = 8;
const CELL_H: u32 = 16;
const BASELINE: i32 = 12;

/// Fixed-shape rasterizer: every glyph inks a 6x12 block, with a tall variant
/// for double-height runs.
struct TestRasterizer {
    rasterize_calls: usize,
}

impl TestRasterizer {
    fn new() -> Self {
        Self { rasterize_calls: 0 }
    }

    fn box_for(run: &GlyphRun) -> BlackBox {
        if run.line_rendition.is_double_height() {
            BlackBox {
                left: 1,
                top: -24,
                right: 13,
                bottom: 4,
            }
        } else if run.glyph_index >= 200 {
            // Ligature-shaped: two cells wide, overhanging to the left.
            BlackBox {
                left: -1,
                top: -10,
                right: 15,
                bottom: 2,
            }
        } else {
            BlackBox {
                left: 0,
                top: -10,
                right: 6,
                bottom: 2,
            }
        }
    }
}

impl GlyphRasterizer for TestRasterizer {
    fn glyph_bounds(&mut self, run: &GlyphRun) -> Result<BlackBox, RenderError> {
        Ok(Self::box_for(run))
    }

    fn draw_glyph(
        &mut self,
        target: &mut AtlasBitmap,
        origin: (i32, i32),
        run: &GlyphRun,
    ) -> Result<bool, RenderError> {
        self.rasterize_calls += 1;
        let b = Self::box_for(run);
        let pixels = vec![0xff; (b.width() * b.height() * 4) as usize];
        target.blit(origin.0 + b.left, origin.1 + b.top, b.width(), b.height(), &pixels);
        Ok(false)
    }
}

fn test_font() -> FontSettings {
    FontSettings {
        cell_size: UVec2::new(CELL_W, CELL_H),
        baseline: BASELINE,
        descender: 3,
        thin_line_width: 1,
        underline_pos: 13,
        underline_width: 1,
        ..Default::default()
    }
}

fn payload(cols: u32, rows: u32) -> RenderingPayload {
    let stride = cols as usize;
    RenderingPayload {
        generation: 1,
        font_generation: 1,
        misc_generation: 1,
        font: test_font(),
        cell_count: UVec2::new(cols, rows),
        target_size: UVec2::new(cols * CELL_W, rows * CELL_H),
        rows: (0..rows).map(|_| ShapedRow::new()).collect(),
        color_bitmap: vec![0xff20201f; stride * 2 * rows as usize],
        color_bitmap_row_stride: stride,
        color_bitmap_generations: [1, 1],
        invalidated_rows: 0..rows as u16,
        dirty_rect_in_px: Rect::invalid(),
        ..Default::default()
    }
}

/// Put `glyphs` on row `y` as one single-font mapping with 8 px advances.
fn set_row_text(p: &mut RenderingPayload, y: usize, glyphs: &[u16]) {
    let row = &mut p.rows[y];
    row.glyph_indices = glyphs.to_vec();
    row.glyph_advances = vec![CELL_W as f32; glyphs.len()];
    row.glyph_offsets = vec![GlyphOffset::default(); glyphs.len()];
    row.colors = vec![0xffffffff; glyphs.len()];
    row.mappings = vec![FontMapping {
        font_face: Some(FontFaceId(7)),
        glyphs_from: 0,
        glyphs_to: glyphs.len() as u32,
    }];
}

struct Harness {
    atlas: GlyphAtlas,
    composer: FrameComposer,
    quads: QuadStream,
    rasterizer: TestRasterizer,
    flushed: Vec<QuadInstance>,
    flush_count: usize,
}

impl Harness {
    fn new() -> Self {
        Self {
            atlas: GlyphAtlas::new(4096),
            composer: FrameComposer::new(),
            quads: QuadStream::new(),
            rasterizer: TestRasterizer::new(),
            flushed: Vec::new(),
            flush_count: 0,
        }
    }

    fn compose(&mut self, p: &mut RenderingPayload) {
        self.atlas.reset(&p.font, p.target_size);
        let flushed = &mut self.flushed;
        let flush_count = &mut self.flush_count;
        let mut flush = |_p: &RenderingPayload, quads: &mut QuadStream, _a: &mut GlyphAtlas| {
            *flush_count += 1;
            flushed.extend_from_slice(quads.instances());
            let mut batches = Vec::new();
            quads.take_batches(&mut batches);
        };
        self.composer
            .compose(p, &mut self.atlas, &mut self.rasterizer, &mut self.quads, &mut flush)
            .expect("compose");
    }

    /// All quads of the frame in emission order (mid-frame flushes first).
    fn all_quads(&self) -> Vec<QuadInstance> {
        let mut all = self.flushed.clone();
        all.extend_from_slice(self.quads.instances());
        all
    }
}

fn shading(q: &QuadInstance) -> ShadingType {
    // Strip the ligature marker so comparisons see the base type.
    ShadingType(q.shading_type as u16 & !ShadingType::LIGATURE_MARKER.0)
}

#[test]
fn empty_frame_emits_one_background_quad() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    h.compose(&mut p);

    let quads = h.all_quads();
    assert_eq!(quads.len(), 1);
    assert_eq!(shading(&quads[0]), ShadingType::BACKGROUND);
    assert_eq!(quads[0].position, [0, 0]);
    assert_eq!(quads[0].size, [(80 * CELL_W) as u16, (24 * CELL_H) as u16]);
    assert_eq!(h.rasterizer.rasterize_calls, 0);
    assert!(h.atlas.is_empty(), "an empty frame must not touch the atlas");
}

#[test]
fn ascii_row_emits_text_quads_in_x_order_and_dirties_the_baseline_strip() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    set_row_text(&mut p, 0, &[104, 105]); // "hi"
    h.compose(&mut p);

    let quads = h.all_quads();
    let text: Vec<_> = quads
        .iter()
        .filter(|q| shading(q) == ShadingType::TEXT_GRAYSCALE)
        .collect();
    assert_eq!(text.len(), 2);
    assert!(
        text[0].position[0] < text[1].position[0],
        "glyph quads must advance in x"
    );
    for q in &text {
        assert_eq!(q.size, [6, 12]);
    }

    // Ink spans [baseline - 10, baseline + 2).
    assert!(p.dirty_rect_in_px.top <= BASELINE - 10);
    assert!(p.dirty_rect_in_px.bottom >= BASELINE + 2);
}

#[test]
fn invert_cursor_draws_xor_backdrop_then_inverted_overlay() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    set_row_text(&mut p, 0, &[104, 105]);
    p.cursor_rect = Rect::new(1, 0, 2, 1); // over the "i"
    p.cursor.cursor_type = CursorType::FullBox;
    p.cursor.cursor_color = INVERT_CURSOR_COLOR;
    h.compose(&mut p);

    let quads = h.all_quads();
    // Order: background, cursor pass 1, two glyphs, cursor pass 2.
    assert_eq!(quads.len(), 5);
    assert_eq!(shading(&quads[1]), ShadingType::SOLID_FILL);
    assert_eq!(quads[1].color, 0xff20201f ^ 0x3f3f3f);
    assert_eq!(shading(&quads[2]), ShadingType::TEXT_GRAYSCALE);
    assert_eq!(shading(&quads[3]), ShadingType::TEXT_GRAYSCALE);
    assert_eq!(shading(&quads[4]), ShadingType::SOLID_FILL);
    assert_eq!(quads[4].color, 0xffffffff);
    assert_eq!(quads[4].position, [(CELL_W as i16), 0]);

    // The overlay is sandwiched by blend-state markers: invert, then back.
    let mut batches = Vec::new();
    h.quads.take_batches(&mut batches);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].blend, BlendMode::Default);
    assert_eq!(batches[0].instance_count, 4);
    assert_eq!(batches[1].blend, BlendMode::Invert);
    assert_eq!(batches[1].base_instance, 4);
    assert_eq!(batches[1].instance_count, 1);
}

#[test]
fn double_underscore_cursor_shapes_two_thin_strips() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    p.cursor_rect = Rect::new(5, 0, 6, 1);
    p.cursor.cursor_type = CursorType::DoubleUnderscore;
    p.cursor.cursor_color = 0xff0000ff; // visible red, straight alpha
    p.font.double_underline_pos = glyphgrid::payload::IVec2::new(12, 15);
    h.compose(&mut p);

    // A visible-color cursor emits nothing in pass 1; pass 2 draws the rects.
    let quads = h.all_quads();
    let cursor: Vec<_> = quads
        .iter()
        .filter(|q| shading(q) == ShadingType::SOLID_FILL && q.color == 0xff0000ff)
        .collect();
    assert_eq!(cursor.len(), 2);
    assert_eq!(cursor[0].position, [(5 * CELL_W) as i16, 12]);
    assert_eq!(cursor[1].position, [(5 * CELL_W) as i16, 15]);
    assert_eq!(cursor[0].size, [CELL_W as u16, 1]);
    assert_eq!(cursor[1].size, [CELL_W as u16, 1]);
}

#[test]
fn row_order_is_cursor1_text_gridlines_cursor2_selection() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    set_row_text(&mut p, 0, &[65]);
    p.rows[0].grid_line_ranges = vec![GridLineRange {
        from: 0,
        to: 1,
        lines: GridLineSet::UNDERLINE,
        color: 0xff00ff00,
    }];
    p.rows[0].selection_from = 0;
    p.rows[0].selection_to = 3;
    p.cursor_rect = Rect::new(0, 0, 1, 1);
    p.cursor.cursor_type = CursorType::FullBox;
    p.cursor.cursor_color = INVERT_CURSOR_COLOR;
    h.compose(&mut p);

    let quads = h.all_quads();
    let kinds: Vec<u32> = quads.iter().map(|q| q.shading_type).collect();
    assert_eq!(
        kinds,
        vec![
            ShadingType::BACKGROUND.0 as u32,    // frame background
            ShadingType::SOLID_FILL.0 as u32,    // cursor pass 1 (xor backdrop)
            ShadingType::TEXT_GRAYSCALE.0 as u32, // glyph
            ShadingType::SOLID_FILL.0 as u32,    // underline gridline
            ShadingType::SOLID_FILL.0 as u32,    // cursor pass 2 (invert overlay)
            ShadingType::SOLID_FILL.0 as u32,    // selection
        ]
    );
}

#[test]
fn selection_rows_with_identical_spans_merge_into_one_quad() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    for y in 2..5 {
        p.rows[y].selection_from = 10;
        p.rows[y].selection_to = 20;
    }
    p.rows[6].selection_from = 1;
    p.rows[6].selection_to = 2;
    p.misc.selection_color = 0x7f996633;
    h.compose(&mut p);

    let quads = h.all_quads();
    let selection: Vec<_> = quads
        .iter()
        .filter(|q| q.color == 0x7f996633)
        .collect();
    assert_eq!(selection.len(), 2, "equal spans merge, distinct spans don't");
    assert_eq!(selection[0].position, [(10 * CELL_W) as i16, (2 * CELL_H) as i16]);
    assert_eq!(
        selection[0].size,
        [(10 * CELL_W) as u16, (3 * CELL_H) as u16]
    );
    assert_eq!(selection[1].size, [CELL_W as u16, CELL_H as u16]);
}

#[test]
fn foreground_bitmap_upload_skip_follows_the_ligature_marker() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    set_row_text(&mut p, 0, &[104, 105]);
    h.compose(&mut p);
    assert!(
        h.composer.skip_foreground_bitmap_upload(),
        "no ligature-marked glyph was emitted"
    );

    // A glyph at least a cell wide whose ink overhangs the trigger margins is
    // marked as a ligature; the foreground half must then upload.
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    p.font.ligature_overhang_trigger_left = 0;
    p.font.ligature_overhang_trigger_right = 5;
    set_row_text(&mut p, 0, &[200]);
    h.compose(&mut p);
    assert!(!h.composer.skip_foreground_bitmap_upload());
}

#[test]
fn pack_failure_mid_row_flushes_resets_and_keeps_every_glyph_exactly_once() {
    let mut h = Harness::new();
    // Small target caps the atlas low enough that 300 unique glyphs cannot
    // fit in one generation.
    let mut p = payload(16, 7);
    let glyphs: Vec<u16> = (0..300).collect();
    set_row_text(&mut p, 0, &glyphs);
    h.compose(&mut p);

    assert!(h.flush_count >= 1, "expected at least one retry flush");

    let quads = h.all_quads();
    let mut seen_x = std::collections::HashSet::new();
    let text: Vec<_> = quads
        .iter()
        .filter(|q| shading(q) == ShadingType::TEXT_GRAYSCALE)
        .collect();
    assert_eq!(text.len(), 300, "every glyph appears exactly once");
    for q in &text {
        assert!(seen_x.insert(q.position[0]), "duplicate glyph quad");
    }
}

#[test]
fn mass_insertion_grows_the_atlas_and_keeps_packing_disjoint() {
    let font = test_font();
    // Target sized so the initial atlas is exactly 128x128.
    let target = UVec2::new(128, 120);
    let mut atlas = GlyphAtlas::new(4096);
    atlas.reset(&font, target);
    assert_eq!(atlas.texture_size(), UVec2::new(128, 128));

    let key = FontFaceKey {
        font_face: Some(FontFaceId(7)),
        line_rendition: LineRendition::SingleWidth,
    };
    let mut rasterizer = TestRasterizer::new();
    let mut resets = 0;

    for glyph_index in 0..10_000u16 {
        loop {
            match atlas.glyph(key, glyph_index, &mut rasterizer, &font) {
                Ok(_) => break,
                Err(AtlasError::Full) => {
                    resets += 1;
                    atlas.reset(&font, target);
                }
                Err(AtlasError::Fatal(e)) => panic!("unexpected fatal error: {e}"),
            }
        }
    }

    assert!(resets >= 1, "10k glyphs must overflow a 128x128 atlas");
    let size = atlas.texture_size();
    assert!(size.x.is_power_of_two() && size.y.is_power_of_two());
    assert!(size.x.max(size.y) >= 256);

    // Every surviving placement is disjoint and in bounds.
    let entries: Vec<_> = atlas
        .iter_glyphs()
        .filter(|(_, _, g)| g.size != [0, 0])
        .collect();
    for (i, (_, _, a)) in entries.iter().enumerate() {
        assert!(a.texcoord[0] as u32 + a.size[0] as u32 <= size.x);
        assert!(a.texcoord[1] as u32 + a.size[1] as u32 <= size.y);
        for (_, _, b) in entries.iter().skip(i + 1) {
            let disjoint = a.texcoord[0] + a.size[0] <= b.texcoord[0]
                || b.texcoord[0] + b.size[0] <= a.texcoord[0]
                || a.texcoord[1] + a.size[1] <= b.texcoord[1]
                || b.texcoord[1] + b.size[1] <= a.texcoord[1];
            assert!(disjoint, "overlapping atlas placements");
        }
    }
}

#[test]
fn double_height_top_row_draws_only_the_top_half() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    set_row_text(&mut p, 0, &[65]);
    p.rows[0].line_rendition = LineRendition::DoubleHeightTop;
    h.compose(&mut p);

    // Rasterized height is 28 px; with baseline 12 and descender 3 the split
    // puts 15 px in the top half and 13 in the bottom.
    let quads = h.all_quads();
    let text: Vec<_> = quads
        .iter()
        .filter(|q| shading(q) == ShadingType::TEXT_GRAYSCALE)
        .collect();
    assert_eq!(text.len(), 1);
    assert_eq!(text[0].size[1], 15);

    // The sibling bottom entry exists and the halves cover the whole glyph.
    let bottom = h
        .atlas
        .peek(
            FontFaceKey {
                font_face: Some(FontFaceId(7)),
                line_rendition: LineRendition::DoubleHeightBottom,
            },
            65,
        )
        .expect("bottom half entry");
    assert_eq!(text[0].size[1] as u16 + bottom.size[1], 28);
}

#[test]
fn soft_font_mapping_rasterizes_from_the_pattern_table() {
    let mut h = Harness::new();
    let mut p = payload(80, 24);
    p.font.soft_font_cell_size = UVec2::new(8, 16);
    p.font.soft_font_pattern = vec![0xaa00; 16];
    p.font.antialiasing_mode = AntialiasingMode::Aliased;

    let row = &mut p.rows[0];
    row.glyph_indices = vec![glyphgrid::payload::SOFT_FONT_GLYPH_BASE];
    row.glyph_advances = vec![CELL_W as f32];
    row.glyph_offsets = vec![GlyphOffset::default()];
    row.colors = vec![0xffffffff];
    row.mappings = vec![FontMapping {
        font_face: None,
        glyphs_from: 0,
        glyphs_to: 1,
    }];
    h.compose(&mut p);

    let quads = h.all_quads();
    let text: Vec<_> = quads
        .iter()
        .filter(|q| shading(q) == ShadingType::TEXT_GRAYSCALE)
        .collect();
    assert_eq!(text.len(), 1);
    assert_eq!(text[0].size, [CELL_W as u16, CELL_H as u16]);
    // Soft glyphs sit flush with the cell: baseline minus the font baseline.
    assert_eq!(text[0].position, [0, 0]);
    assert_eq!(h.rasterizer.rasterize_calls, 0, "soft fonts bypass the rasterizer");
}
