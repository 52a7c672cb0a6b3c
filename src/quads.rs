//! The per-frame quad instance stream.
//!
//! Every primitive the renderer draws is a textured quad described by one
//! packed [`QuadInstance`]. Instances are appended in paint order into a
//! [`QuadStream`]; blend-state markers punctuate the stream and
//! [`QuadStream::take_batches`] turns it into a list of indexed-instanced
//! draw calls, one per span between markers.

use bytemuck::{Pod, Zeroable};

/// Shading routine selector stored in each quad instance.
///
/// The high bit is the ligature marker, OR'able onto the text types; it makes
/// the pixel shader clamp glyph color to the per-cell foreground bitmap so a
/// ligature spanning several cells can't bleed one cell's color into the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadingType(pub u16);

impl ShadingType {
    /// Emits no pixels; used for whitespace halves of split glyphs.
    pub const DEFAULT: Self = Self(0);
    /// Fullscreen quad sampling the background half of the color bitmap.
    pub const BACKGROUND: Self = Self(1);
    /// Untextured fill with the instance color.
    pub const SOLID_FILL: Self = Self(2);
    /// Atlas alpha mask tinted with the instance color.
    pub const TEXT_GRAYSCALE: Self = Self(3);
    /// Atlas per-channel ClearType weights, blended dual-source.
    pub const TEXT_CLEARTYPE: Self = Self(4);
    /// Atlas BGRA copied through unmodified (color emoji).
    pub const PASSTHROUGH: Self = Self(5);
    /// High-bit flag, not a standalone type.
    pub const LIGATURE_MARKER: Self = Self(0x8000);

    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    /// Accumulate for the frame-wide shading-type OR.
    pub fn accumulate(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// One packed per-instance record, laid out exactly as the GPU reads it.
///
/// `color` is `0xAABBGGRR`, i.e. an `R8G8B8A8_UNORM` view of the bytes;
/// straight or premultiplied alpha depending on the shading type.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct QuadInstance {
    pub shading_type: u32,
    /// Target pixels; signed because glyph ink may overhang the surface.
    pub position: [i16; 2],
    /// Pixels.
    pub size: [u16; 2],
    /// Atlas pixels.
    pub texcoord: [u16; 2],
    pub color: u32,
}

// The GPU input layout depends on this exact packing.
const _: () = assert!(std::mem::size_of::<QuadInstance>() == 20);

impl QuadInstance {
    pub fn shading(&self) -> ShadingType {
        ShadingType(self.shading_type as u16)
    }
}

/// The two precomputed blend states draws switch between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Dual-source: source-over for regular quads, weighted lerp for ClearType.
    #[default]
    Default,
    /// `1 - dst` subtractive blend for the inverting cursor pass.
    Invert,
}

#[derive(Debug, Clone, Copy)]
struct StateChange {
    blend: Option<BlendMode>,
    offset: u32,
}

/// One indexed-instanced draw over a contiguous instance span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawBatch {
    /// Blend state active while this span draws.
    pub blend: BlendMode,
    pub base_instance: u32,
    pub instance_count: u32,
}

/// Append-only instance buffer with blend-state markers.
///
/// Cleared at the end of every frame; capacity only grows.
#[derive(Debug, Default)]
pub struct QuadStream {
    instances: Vec<QuadInstance>,
    state_changes: Vec<StateChange>,
}

/// Initial CPU-side instance capacity.
const INITIAL_CAPACITY: usize = 256;

impl QuadStream {
    pub fn new() -> Self {
        Self {
            instances: Vec::with_capacity(INITIAL_CAPACITY),
            state_changes: Vec::new(),
        }
    }

    /// Append a zeroed instance and return it for in-place initialization.
    pub fn append(&mut self) -> &mut QuadInstance {
        self.instances.push(QuadInstance::default());
        self.instances.last_mut().unwrap()
    }

    /// The most recently appended instance. Used to extend a selection quad
    /// downwards instead of emitting a duplicate.
    pub fn last_mut(&mut self) -> &mut QuadInstance {
        debug_assert!(!self.instances.is_empty());
        self.instances.last_mut().unwrap()
    }

    /// Record that every instance from here on draws with `blend`.
    pub fn mark_state_change(&mut self, blend: BlendMode) {
        self.state_changes.push(StateChange {
            blend: Some(blend),
            offset: self.instances.len() as u32,
        });
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[QuadInstance] {
        &self.instances
    }

    /// Convert the markers into draw batches and clear the stream.
    ///
    /// A terminal sentinel covers the span after the last marker. The frame
    /// always starts in [`BlendMode::Default`].
    pub fn take_batches(&mut self, out: &mut Vec<DrawBatch>) {
        out.clear();
        self.state_changes.push(StateChange {
            blend: None,
            offset: self.instances.len() as u32,
        });

        let mut blend = BlendMode::Default;
        let mut previous_offset = 0u32;
        for change in &self.state_changes {
            let count = change.offset - previous_offset;
            if count != 0 {
                out.push(DrawBatch {
                    blend,
                    base_instance: previous_offset,
                    instance_count: count,
                });
            }
            if let Some(next) = change.blend {
                blend = next;
            }
            previous_offset = change.offset;
        }

        self.state_changes.clear();
        self.instances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_n(stream: &mut QuadStream, n: usize) {
        for _ in 0..n {
            stream.append().shading_type = ShadingType::SOLID_FILL.0 as u32;
        }
    }

    #[test]
    fn instance_record_is_bit_exact() {
        assert_eq!(std::mem::size_of::<QuadInstance>(), 20);
        let q = QuadInstance {
            shading_type: ShadingType::TEXT_GRAYSCALE.0 as u32,
            position: [-2, 5],
            size: [7, 11],
            texcoord: [64, 32],
            color: 0xff00ff00,
        };
        let bytes: &[u8] = bytemuck::bytes_of(&q);
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..6], &(-2i16).to_le_bytes());
        assert_eq!(&bytes[16..20], &[0x00, 0xff, 0x00, 0xff]);
    }

    #[test]
    fn unmarked_stream_is_one_default_batch() {
        let mut stream = QuadStream::new();
        push_n(&mut stream, 5);
        let mut batches = Vec::new();
        stream.take_batches(&mut batches);
        assert_eq!(
            batches,
            vec![DrawBatch {
                blend: BlendMode::Default,
                base_instance: 0,
                instance_count: 5,
            }]
        );
        assert!(stream.is_empty());
    }

    #[test]
    fn markers_split_the_stream_into_spans() {
        let mut stream = QuadStream::new();
        push_n(&mut stream, 3);
        stream.mark_state_change(BlendMode::Invert);
        push_n(&mut stream, 2);
        stream.mark_state_change(BlendMode::Default);
        push_n(&mut stream, 4);

        let mut batches = Vec::new();
        stream.take_batches(&mut batches);
        assert_eq!(
            batches,
            vec![
                DrawBatch {
                    blend: BlendMode::Default,
                    base_instance: 0,
                    instance_count: 3,
                },
                DrawBatch {
                    blend: BlendMode::Invert,
                    base_instance: 3,
                    instance_count: 2,
                },
                DrawBatch {
                    blend: BlendMode::Default,
                    base_instance: 5,
                    instance_count: 4,
                },
            ]
        );
    }

    #[test]
    fn adjacent_markers_produce_no_empty_batches() {
        let mut stream = QuadStream::new();
        push_n(&mut stream, 1);
        stream.mark_state_change(BlendMode::Invert);
        stream.mark_state_change(BlendMode::Default);
        push_n(&mut stream, 1);

        let mut batches = Vec::new();
        stream.take_batches(&mut batches);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].blend, BlendMode::Default);
        assert_eq!(batches[1].base_instance, 1);
    }

    #[test]
    fn ligature_marker_accumulates() {
        let mut acc = ShadingType::DEFAULT;
        acc.accumulate(ShadingType::TEXT_GRAYSCALE);
        assert!(!acc.contains(ShadingType::LIGATURE_MARKER));
        acc.accumulate(ShadingType::TEXT_GRAYSCALE.with(ShadingType::LIGATURE_MARKER));
        assert!(acc.contains(ShadingType::LIGATURE_MARKER));
    }
}
