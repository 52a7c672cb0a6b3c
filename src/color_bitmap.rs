//! Upload planning for the per-cell color bitmap.
//!
//! The color bitmap is a `cell_count.x x (2 * cell_count.y)` texture holding
//! per-cell background colors in the top half and foreground colors in the
//! bottom half. Skipping its upload halves the GPU traffic of an idle frame,
//! so both halves carry content generations and the foreground half is also
//! skippable whenever the frame emitted no ligature-marked glyph (the pixel
//! shader then never samples it).

use crate::payload::RenderingPayload;

/// Dual-generation cache deciding whether this frame's color bitmap upload
/// can be skipped.
#[derive(Debug)]
pub struct ColorBitmap {
    /// Generations of the last uploaded background and foreground halves.
    /// `u64::MAX` means never uploaded; payload generations start at 0, so 0
    /// is not a safe "never matches" sentinel.
    generations: [u64; 2],
}

impl ColorBitmap {
    pub fn new() -> Self {
        Self {
            generations: [u64::MAX; 2],
        }
    }

    /// Forget the cached generations; the next frame re-uploads. Called when
    /// the texture is recreated on a cell-count change.
    pub fn invalidate(&mut self) {
        self.generations = [u64::MAX; 2];
    }

    /// Whether the payload's bitmap must be copied to the GPU this frame.
    ///
    /// The upload is all-or-nothing: a changed background generation drags
    /// the foreground half along. `skip_foreground` is set when no emitted
    /// glyph carried the ligature marker.
    pub fn needs_upload(&self, p: &RenderingPayload, skip_foreground: bool) -> bool {
        !(self.generations[0] == p.color_bitmap_generations[0]
            && (self.generations[1] == p.color_bitmap_generations[1] || skip_foreground))
    }

    /// Record a completed upload.
    pub fn mark_uploaded(&mut self, p: &RenderingPayload) {
        self.generations = p.color_bitmap_generations;
    }
}

impl Default for ColorBitmap {
    fn default() -> Self {
        Self::new()
    }
}
