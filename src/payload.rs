//! Per-frame input to the renderer.
//!
//! A [`RenderingPayload`] is the complete logical description of one terminal
//! frame: shaped glyph rows, per-cell colors, cursor, selection, gridlines and
//! the settings generations used to detect structural changes. Glyph shaping
//! and font fallback happen upstream; the payload only carries glyph indices
//! into already-resolved font faces.

use crate::error::RenderError;

/// Unsigned 2D vector in pixels or cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UVec2 {
    pub x: u32,
    pub y: u32,
}

/// Signed 2D vector in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IVec2 {
    pub x: i32,
    pub y: i32,
}

impl UVec2 {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub const fn area(self) -> u32 {
        self.x * self.y
    }
}

impl IVec2 {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle, inclusive-exclusive, in pixels or cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// An "inverted infinite" rect that any union will replace.
    pub const fn invalid() -> Self {
        Self {
            left: i32::MAX,
            top: i32::MAX,
            right: i32::MIN,
            bottom: i32::MIN,
        }
    }
}

/// Opaque handle to a resolved font face.
///
/// The renderer never inspects it; it only participates in glyph cache keys
/// and is handed back to the injected [`GlyphRasterizer`](crate::rasterizer::GlyphRasterizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FontFaceId(pub u64);

/// Per-row scaling attribute (DECDWL / DECDHL).
///
/// The ordering matters: everything at or above `DoubleHeightTop` is a
/// double-height rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LineRendition {
    #[default]
    SingleWidth,
    DoubleWidth,
    DoubleHeightTop,
    DoubleHeightBottom,
}

impl LineRendition {
    pub fn is_double_height(self) -> bool {
        self >= LineRendition::DoubleHeightTop
    }

    /// The other half of a double-height pair.
    pub fn opposite_half(self) -> Self {
        match self {
            LineRendition::DoubleHeightTop => LineRendition::DoubleHeightBottom,
            LineRendition::DoubleHeightBottom => LineRendition::DoubleHeightTop,
            other => other,
        }
    }
}

/// Set of grid-line decorations applied to a cell range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridLineSet(pub u8);

impl GridLineSet {
    pub const LEFT: Self = Self(1 << 0);
    pub const TOP: Self = Self(1 << 1);
    pub const RIGHT: Self = Self(1 << 2);
    pub const BOTTOM: Self = Self(1 << 3);
    pub const UNDERLINE: Self = Self(1 << 4);
    pub const HYPERLINK_UNDERLINE: Self = Self(1 << 5);
    pub const DOUBLE_UNDERLINE: Self = Self(1 << 6);
    pub const STRIKETHROUGH: Self = Self(1 << 7);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn any(self) -> bool {
        self.0 != 0
    }
}

/// A run of cells sharing the same grid-line decorations and color.
#[derive(Debug, Clone, Copy)]
pub struct GridLineRange {
    /// First cell column, inclusive.
    pub from: u16,
    /// Last cell column, exclusive.
    pub to: u16,
    pub lines: GridLineSet,
    /// `0xAABBGGRR`.
    pub color: u32,
}

/// One contiguous glyph slice drawn with a single font face.
#[derive(Debug, Clone, Copy)]
pub struct FontMapping {
    /// `None` selects the soft-font path: glyph indices address the payload's
    /// `soft_font_pattern` instead of a real font face.
    pub font_face: Option<FontFaceId>,
    /// First glyph position, inclusive.
    pub glyphs_from: u32,
    /// Last glyph position, exclusive.
    pub glyphs_to: u32,
}

/// Per-glyph positional adjustment relative to the pen position.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlyphOffset {
    pub advance_offset: f32,
    pub ascender_offset: f32,
}

/// One shaped cell-row.
///
/// `glyph_indices`, `glyph_advances`, `glyph_offsets` and `colors` are
/// parallel arrays indexed by glyph position; `mappings` slices them into
/// per-font-face runs.
#[derive(Debug, Clone, Default)]
pub struct ShapedRow {
    pub mappings: Vec<FontMapping>,
    pub glyph_indices: Vec<u16>,
    pub glyph_advances: Vec<f32>,
    pub glyph_offsets: Vec<GlyphOffset>,
    /// `0xAABBGGRR` per glyph.
    pub colors: Vec<u32>,
    pub grid_line_ranges: Vec<GridLineRange>,
    /// Selection start column, inclusive. `to <= from` means no selection.
    pub selection_from: u16,
    /// Selection end column, exclusive.
    pub selection_to: u16,
    pub line_rendition: LineRendition,
    /// In-out: vertical extent of glyph ink on this row, in target pixels.
    pub dirty_top: i32,
    pub dirty_bottom: i32,
}

impl ShapedRow {
    pub fn new() -> Self {
        Self {
            dirty_top: i32::MAX,
            dirty_bottom: i32::MIN,
            ..Default::default()
        }
    }
}

/// Cursor shape requested by the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    Legacy,
    VerticalBar,
    Underscore,
    EmptyBox,
    FullBox,
    DoubleUnderscore,
}

/// Sentinel cursor color selecting the invert-blend cursor.
pub const INVERT_CURSOR_COLOR: u32 = 0xffffffff;

/// Cursor appearance settings.
#[derive(Debug, Clone, Copy)]
pub struct CursorSettings {
    pub cursor_type: CursorType,
    /// Legacy cursor height, percent of the cell height.
    pub height_percentage: u32,
    /// `0xAABBGGRR`, or [`INVERT_CURSOR_COLOR`] to invert the background.
    pub cursor_color: u32,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            cursor_type: CursorType::Legacy,
            height_percentage: 20,
            cursor_color: INVERT_CURSOR_COLOR,
        }
    }
}

/// Glyph antialiasing policy, mirrored into shading-type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntialiasingMode {
    #[default]
    Grayscale,
    ClearType,
    Aliased,
}

/// Font metrics resolved by the shaping layer, all in target pixels.
#[derive(Debug, Clone)]
pub struct FontSettings {
    pub cell_size: UVec2,
    /// Baseline y offset from the cell top.
    pub baseline: i32,
    /// Descender gap below the baseline.
    pub descender: i32,
    pub thin_line_width: u32,
    pub underline_pos: i32,
    pub underline_width: u32,
    /// y offsets of the two lines of a double underline.
    pub double_underline_pos: IVec2,
    pub strikethrough_pos: i32,
    pub strikethrough_width: u32,
    /// Black-box overhang thresholds that mark a glyph as a ligature.
    pub ligature_overhang_trigger_left: i32,
    pub ligature_overhang_trigger_right: i32,
    /// Dimensions of one soft-font glyph pattern.
    pub soft_font_cell_size: UVec2,
    /// One `u16` per pattern row, MSB-left, rows of consecutive glyphs
    /// appended back to back.
    pub soft_font_pattern: Vec<u16>,
    /// Em size handed to the rasterizer.
    pub font_size: f32,
    pub dpi: u32,
    pub antialiasing_mode: AntialiasingMode,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            cell_size: UVec2::new(8, 16),
            baseline: 12,
            descender: 3,
            thin_line_width: 1,
            underline_pos: 13,
            underline_width: 1,
            double_underline_pos: IVec2::new(12, 15),
            strikethrough_pos: 8,
            strikethrough_width: 1,
            ligature_overhang_trigger_left: -1,
            ligature_overhang_trigger_right: 9,
            soft_font_cell_size: UVec2::new(8, 16),
            soft_font_pattern: Vec::new(),
            font_size: 12.0,
            dpi: 96,
            antialiasing_mode: AntialiasingMode::Grayscale,
        }
    }
}

/// Miscellaneous frame-level settings.
#[derive(Debug, Clone, Default)]
pub struct MiscSettings {
    /// `0xAABBGGRR`, straight alpha.
    pub background_color: u32,
    /// `0xAABBGGRR`, straight alpha.
    pub selection_color: u32,
    /// WGSL post-process pixel shader, applied off-screen → swap chain.
    pub custom_pixel_shader_path: Option<std::path::PathBuf>,
    /// Use the builtin retro terminal shader instead of a user shader.
    pub use_retro_terminal_effect: bool,
}

/// First glyph index of the soft-font private range.
pub const SOFT_FONT_GLYPH_BASE: u16 = 0xEF20;

/// The complete logical description of one frame.
#[derive(Default)]
pub struct RenderingPayload {
    /// Overall settings generation; bumped whenever any sub-generation is.
    pub generation: u64,
    pub font_generation: u64,
    pub misc_generation: u64,

    pub font: FontSettings,
    pub misc: MiscSettings,
    pub cursor: CursorSettings,

    /// Terminal dimensions in cells.
    pub cell_count: UVec2,
    /// Render surface size in pixels; at least `cell_count * cell_size`.
    pub target_size: UVec2,

    /// One entry per cell-row, top to bottom.
    pub rows: Vec<ShapedRow>,

    /// Cursor extent in cells, inclusive-exclusive. Empty hides the cursor.
    pub cursor_rect: Rect,

    /// Per-cell colors: `cell_count.y` background rows followed by
    /// `cell_count.y` foreground rows, each `color_bitmap_row_stride` u32s
    /// wide.
    pub color_bitmap: Vec<u32>,
    pub color_bitmap_row_stride: usize,
    /// Content generations of the background and foreground halves.
    pub color_bitmap_generations: [u64; 2],

    /// Row index range whose dirty extents contribute to the frame dirty rect.
    pub invalidated_rows: std::ops::Range<u16>,

    /// In-out: expanded by the renderer, read back by the caller at present.
    pub dirty_rect_in_px: Rect,
}

impl RenderingPayload {
    /// Verify the parallel-array shape invariants.
    ///
    /// A mismatch is a fatal precondition violation: the frame is skipped, no
    /// partial presentation occurs.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.rows.len() != self.cell_count.y as usize {
            return Err(RenderError::InvalidPayload("row count != cell_count.y"));
        }
        for row in &self.rows {
            let n = row.glyph_indices.len();
            if row.glyph_advances.len() != n
                || row.glyph_offsets.len() != n
                || row.colors.len() != n
            {
                return Err(RenderError::InvalidPayload(
                    "glyph arrays of a row have mismatched lengths",
                ));
            }
            for m in &row.mappings {
                if m.glyphs_from > m.glyphs_to || m.glyphs_to as usize > n {
                    return Err(RenderError::InvalidPayload(
                        "font mapping exceeds the row's glyph arrays",
                    ));
                }
            }
        }
        if self.color_bitmap_row_stride < self.cell_count.x as usize {
            return Err(RenderError::InvalidPayload(
                "color bitmap row stride below cell_count.x",
            ));
        }
        let required = self.color_bitmap_row_stride * 2 * self.cell_count.y as usize;
        if self.color_bitmap.len() < required {
            return Err(RenderError::InvalidPayload("color bitmap too small"));
        }
        Ok(())
    }

    /// Background color of the cell at `(x, y)`, forced opaque.
    pub fn background_at(&self, x: u32, y: u32) -> u32 {
        let offset = y as usize * self.color_bitmap_row_stride + x as usize;
        self.color_bitmap[offset] | 0xff000000
    }
}

/// Split a `0xAABBGGRR` color into premultiplied-alpha RGBA floats.
pub fn color_premultiply(color: u32) -> [f32; 4] {
    let r = (color & 0xff) as f32 / 255.0;
    let g = ((color >> 8) & 0xff) as f32 / 255.0;
    let b = ((color >> 16) & 0xff) as f32 / 255.0;
    let a = ((color >> 24) & 0xff) as f32 / 255.0;
    [r * a, g * a, b * a, a]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendition_ordering_selects_double_height() {
        assert!(!LineRendition::SingleWidth.is_double_height());
        assert!(!LineRendition::DoubleWidth.is_double_height());
        assert!(LineRendition::DoubleHeightTop.is_double_height());
        assert!(LineRendition::DoubleHeightBottom.is_double_height());
        assert_eq!(
            LineRendition::DoubleHeightTop.opposite_half(),
            LineRendition::DoubleHeightBottom
        );
        assert_eq!(
            LineRendition::DoubleHeightBottom.opposite_half(),
            LineRendition::DoubleHeightTop
        );
    }

    #[test]
    fn validate_rejects_mismatched_rows() {
        let mut p = RenderingPayload {
            cell_count: UVec2::new(4, 1),
            color_bitmap_row_stride: 4,
            color_bitmap: vec![0; 8],
            ..Default::default()
        };
        let mut row = ShapedRow::new();
        row.glyph_indices = vec![1, 2];
        row.glyph_advances = vec![8.0]; // mismatched on purpose
        row.glyph_offsets = vec![GlyphOffset::default(); 2];
        row.colors = vec![0; 2];
        p.rows.push(row);
        assert!(p.validate().is_err());

        p.rows[0].glyph_advances = vec![8.0, 8.0];
        assert!(p.validate().is_ok());
    }

    #[test]
    fn premultiply_scales_rgb_by_alpha() {
        let c = color_premultiply(0x80ff0000); // half-alpha blue (0xAABBGGRR)
        assert!(c[0].abs() < 1e-6);
        assert!(c[1].abs() < 1e-6);
        assert!((c[2] - 0.5019608 * 1.0).abs() < 1e-2);
        assert!((c[3] - 0.5019608).abs() < 1e-6);
    }
}
