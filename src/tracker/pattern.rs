//! Pattern compression model
//!
//! Patterns are short frame-cell sequences reused at many positions.
//! The library is content-addressed and append-only; references name
//! patterns by integer id so the whole graph serialises trivially.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::nes::pitch_table::timer_for;
use crate::nes::{Channel, ChannelTimeline, FrameCell};

/// A reusable run of frame cells. Two patterns with identical cell
/// contents share one id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub id: u32,
    pub cells: Vec<FrameCell>,
}

impl Pattern {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Content-addressed, append-only pattern store shared by all channels.
#[derive(Debug, Clone, Default)]
pub struct PatternLibrary {
    patterns: Vec<Pattern>,
    by_hash: HashMap<u64, Vec<u32>>,
}

impl PatternLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a cell run, returning the existing id when the content is
    /// already present.
    pub fn intern(&mut self, cells: &[FrameCell]) -> u32 {
        let hash = content_hash(cells);
        if let Some(ids) = self.by_hash.get(&hash) {
            for &id in ids {
                if self.patterns[id as usize].cells == cells {
                    return id;
                }
            }
        }
        let id = self.patterns.len() as u32;
        self.patterns.push(Pattern {
            id,
            cells: cells.to_vec(),
        });
        self.by_hash.entry(hash).or_default().push(id);
        id
    }

    /// Look up a pattern id by exact content without interning.
    pub fn find(&self, cells: &[FrameCell]) -> Option<u32> {
        let hash = content_hash(cells);
        self.by_hash.get(&hash).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|&id| self.patterns[id as usize].cells == cells)
        })
    }

    pub fn get(&self, id: u32) -> &Pattern {
        &self.patterns[id as usize]
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }
}

/// Stable hash of a cell run, used for bucketing and interning.
pub fn content_hash(cells: &[FrameCell]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    cells.hash(&mut hasher);
    hasher.finish()
}

/// One placement of a pattern in a channel's frame space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternReference {
    pub frame: u32,
    pub pattern_id: u32,
    pub transpose: i8,
    pub volume_delta: i8,
}

/// Pattern references plus the raw cells they do not cover.
///
/// Reconstructing the dense timeline from this and the library is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChannel {
    pub channel: Channel,
    pub refs: Vec<PatternReference>,
    pub residual: Vec<(u32, FrameCell)>,
}

impl CompressedChannel {
    /// Degenerate form: every frame in the residual. Always valid.
    pub fn uncompressed(timeline: &ChannelTimeline) -> Self {
        Self {
            channel: timeline.channel,
            refs: Vec::new(),
            residual: timeline
                .cells
                .iter()
                .enumerate()
                .map(|(frame, cell)| (frame as u32, *cell))
                .collect(),
        }
    }

    /// Rebuild the dense timeline, bit-exact.
    pub fn decompress(&self, library: &PatternLibrary, total_frames: u32) -> ChannelTimeline {
        let mut timeline = ChannelTimeline::silent(self.channel, total_frames);
        for reference in &self.refs {
            let pattern = library.get(reference.pattern_id);
            for (offset, cell) in pattern.cells.iter().enumerate() {
                let frame = reference.frame as usize + offset;
                if let Some(slot) = timeline.cells.get_mut(frame) {
                    *slot = transform_cell(
                        *cell,
                        self.channel,
                        reference.transpose,
                        reference.volume_delta,
                    );
                }
            }
        }
        for (frame, cell) in &self.residual {
            if let Some(slot) = timeline.cells.get_mut(*frame as usize) {
                *slot = *cell;
            }
        }
        timeline
    }

    /// Encoded size in frame-cell units: pattern references cost
    /// `ref_overhead`, residual entries cost one cell each.
    pub fn encoded_cells(&self, ref_overhead: usize) -> usize {
        self.refs.len() * ref_overhead + self.residual.len()
    }
}

/// Apply a reference's uniform transpose and volume delta to one cell.
///
/// Silent cells never transform; the deltas describe sounding notes
/// only. Channels without volume control ignore the volume delta, and
/// only melodic channels transpose.
pub fn transform_cell(
    cell: FrameCell,
    channel: Channel,
    transpose: i8,
    volume_delta: i8,
) -> FrameCell {
    let Some(note) = cell.note else {
        return cell;
    };
    if transpose == 0 && volume_delta == 0 {
        return cell;
    }
    let mut out = cell;
    if channel.is_melodic() && transpose != 0 {
        let shifted = (i16::from(note) + i16::from(transpose)).clamp(0, 127) as u8;
        out.note = Some(shifted);
        out.timer = timer_for(channel, shifted);
    }
    if channel.has_volume_control() && volume_delta != 0 {
        let volume = (i16::from(cell.volume) + i16::from(volume_delta)).clamp(0, 15) as u8;
        out.volume = volume;
        out.control = (cell.control & 0xF0) | volume;
    }
    out
}

/// The final artifact handed to the code emitter.
#[derive(Debug, Clone)]
pub struct SongModule {
    pub library: PatternLibrary,
    pub channels: Vec<CompressedChannel>,
    pub total_frames: u32,
    /// Driver rate at runtime; always 60 Hz.
    pub frame_rate: u32,
    pub loop_frame: Option<u32>,
}

impl SongModule {
    pub fn channel(&self, channel: Channel) -> &CompressedChannel {
        &self.channels[channel.index()]
    }

    pub fn decompress_channel(&self, channel: Channel) -> ChannelTimeline {
        self.channel(channel)
            .decompress(&self.library, self.total_frames)
    }

    /// Verify the round-trip law against the source timelines.
    pub fn verify_roundtrip(&self, timelines: &[ChannelTimeline]) -> Result<()> {
        for timeline in timelines {
            let rebuilt = self.decompress_channel(timeline.channel);
            if rebuilt.cells != timeline.cells {
                return Err(Error::InternalInvariant {
                    stage: "pattern-detect",
                    message: format!(
                        "{}: decompressed timeline differs from source",
                        timeline.channel.name()
                    ),
                });
            }
        }
        Ok(())
    }
}
