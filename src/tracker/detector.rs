//! Pattern detection
//!
//! Finds maximal repeating cell runs in a channel timeline and emits a
//! compressed representation that reconstructs the input bit-exactly.
//! Detection is infallible: the degenerate all-residual form is always a
//! valid fallback.
//!
//! The phases after enumeration are shared with the parallel detector,
//! which only replaces how the bucket map is produced; given the same
//! bucket map, both produce byte-identical output.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::CompileConfig;
use crate::diagnostics::Diagnostics;
use crate::nes::{ChannelTimeline, FrameCell};
use crate::tracker::pattern::{
    content_hash, transform_cell, CompressedChannel, PatternLibrary, PatternReference,
};

/// Bucket map from phase 1: `(length, content hash)` to ascending
/// window positions.
pub type BucketMap = BTreeMap<(usize, u64), Vec<usize>>;

/// A swappable detection stage, so a slow reference implementation and
/// the parallel production one are interchangeable.
pub trait PatternDetect {
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        timeline: &ChannelTimeline,
        library: &mut PatternLibrary,
        config: &CompileConfig,
        diagnostics: &mut Diagnostics,
    ) -> CompressedChannel;
}

/// Single-threaded reference detector.
#[derive(Debug, Default)]
pub struct SerialDetector;

impl PatternDetect for SerialDetector {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn detect(
        &self,
        timeline: &ChannelTimeline,
        library: &mut PatternLibrary,
        config: &CompileConfig,
        diagnostics: &mut Diagnostics,
    ) -> CompressedChannel {
        detect_with(timeline, library, config, diagnostics, |cells, config, _diags| {
            enumerate_all(cells, config)
        })
    }
}

/// Run detection with a pluggable enumeration phase.
pub(crate) fn detect_with<F>(
    timeline: &ChannelTimeline,
    library: &mut PatternLibrary,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
    enumerate: F,
) -> CompressedChannel
where
    F: Fn(&[FrameCell], &CompileConfig, &mut Diagnostics) -> BucketMap,
{
    let cells = &timeline.cells;
    if cells.len() < config.min_pattern_len {
        return CompressedChannel::uncompressed(timeline);
    }

    if cells.len() > config.sample_cap {
        info!(
            channel = timeline.channel.name(),
            frames = cells.len(),
            cap = config.sample_cap,
            "timeline above sample cap; detecting on a stratified sample"
        );
        // Learn patterns from evenly spaced segments, then compress the
        // full timeline with a dictionary pass over the library.
        for segment in stratified_segments(cells.len(), config.sample_cap) {
            let sub = ChannelTimeline {
                channel: timeline.channel,
                cells: cells[segment.clone()].to_vec(),
            };
            let buckets = enumerate(&sub.cells, config, diagnostics);
            let groups = select_patterns(&sub.cells, buckets, config);
            intern_groups(&sub.cells, &groups, library);
        }
        return dictionary_pass(timeline, library, config);
    }

    let buckets = enumerate(cells, config, diagnostics);
    let groups = select_patterns(cells, buckets, config);
    let compressed = emit_compressed(timeline, groups, library, config);
    debug!(
        channel = timeline.channel.name(),
        patterns = library.len(),
        refs = compressed.refs.len(),
        residual = compressed.residual.len(),
        "pattern detection complete"
    );
    compressed
}

/// Phase 1, serial form: bucket every `(position, length)` window by
/// content hash.
pub(crate) fn enumerate_all(cells: &[FrameCell], config: &CompileConfig) -> BucketMap {
    let mut buckets = BucketMap::new();
    let max_len = config.max_pattern_len.min(cells.len());
    for len in config.min_pattern_len..=max_len {
        enumerate_range(cells, len, 0, cells.len() + 1 - len, &mut buckets);
    }
    buckets
}

/// Bucket windows of one length over `start..end` positions. The
/// parallel detector calls this per chunk.
pub(crate) fn enumerate_range(
    cells: &[FrameCell],
    len: usize,
    start: usize,
    end: usize,
    buckets: &mut BucketMap,
) {
    for pos in start..end.min(cells.len() + 1 - len) {
        let hash = content_hash(&cells[pos..pos + len]);
        buckets.entry((len, hash)).or_default().push(pos);
    }
}

/// An accepted pattern: one content, its non-overlapping occurrences.
#[derive(Debug, Clone)]
pub(crate) struct AcceptedGroup {
    pub len: usize,
    /// Ascending occurrence positions; the first is canonical.
    pub positions: Vec<usize>,
}

/// Phases 2 and 3: score candidates and select non-overlapping
/// occurrences, returning groups in canonical `(length, first)` order.
pub(crate) fn select_patterns(
    cells: &[FrameCell],
    buckets: BucketMap,
    config: &CompileConfig,
) -> Vec<AcceptedGroup> {
    struct Candidate {
        len: usize,
        gain: i64,
        positions: Vec<usize>,
    }

    let overhead = config.ref_overhead as i64;
    let mut candidates: Vec<Candidate> = Vec::new();

    for ((len, _hash), positions) in buckets {
        if positions.len() < 2 {
            continue;
        }
        for group in split_by_content(cells, len, &positions) {
            // Occurrences of one candidate must not overlap each other;
            // first-fit in ascending order is the canonical filter.
            let mut filtered: Vec<usize> = Vec::with_capacity(group.len());
            let mut next_free = 0usize;
            for pos in group {
                if pos >= next_free {
                    next_free = pos + len;
                    filtered.push(pos);
                }
            }
            let occurrences = filtered.len() as i64;
            if occurrences < 2 {
                continue;
            }
            let gain = occurrences * len as i64 - len as i64 - overhead * occurrences;
            if gain <= 0 {
                continue;
            }
            candidates.push(Candidate {
                len,
                gain,
                positions: filtered,
            });
        }
    }

    // Descending gain; ties go to the longer pattern, then the earlier
    // first occurrence, so the ordering is total and deterministic.
    candidates.sort_by(|a, b| {
        b.gain
            .cmp(&a.gain)
            .then(b.len.cmp(&a.len))
            .then(a.positions[0].cmp(&b.positions[0]))
    });

    let mut covered = vec![false; cells.len()];
    let mut accepted: Vec<AcceptedGroup> = Vec::new();
    for candidate in candidates {
        let positions: Vec<usize> = candidate
            .positions
            .iter()
            .copied()
            .filter(|&pos| !covered[pos..pos + candidate.len].iter().any(|&c| c))
            .collect();
        if positions.len() < 2 {
            continue;
        }
        for &pos in &positions {
            covered[pos..pos + candidate.len].iter_mut().for_each(|c| *c = true);
        }
        accepted.push(AcceptedGroup {
            len: candidate.len,
            positions,
        });
    }

    // Canonical id order, independent of selection order.
    accepted.sort_by_key(|g| (g.len, g.positions[0]));
    accepted
}

/// Split one hash bucket into groups of truly identical content.
fn split_by_content(cells: &[FrameCell], len: usize, positions: &[usize]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for &pos in positions {
        let window = &cells[pos..pos + len];
        match groups
            .iter_mut()
            .find(|g| &cells[g[0]..g[0] + len] == window)
        {
            Some(group) => group.push(pos),
            None => groups.push(vec![pos]),
        }
    }
    groups
}

/// Intern accepted groups into the library without emitting references.
/// Used by the sampled path, where references come from the dictionary
/// pass instead.
fn intern_groups(cells: &[FrameCell], groups: &[AcceptedGroup], library: &mut PatternLibrary) {
    for group in groups {
        let first = group.positions[0];
        library.intern(&cells[first..first + group.len]);
    }
}

/// Phase 4 plus variation merging: turn accepted groups into references
/// and residual cells.
pub(crate) fn emit_compressed(
    timeline: &ChannelTimeline,
    groups: Vec<AcceptedGroup>,
    library: &mut PatternLibrary,
    config: &CompileConfig,
) -> CompressedChannel {
    let cells = &timeline.cells;
    let channel = timeline.channel;

    // Optional merge: a later group referencing an earlier one through a
    // uniform transpose / volume delta drops its own pattern cells, which
    // is always strictly smaller than keeping both patterns.
    let mut merged_into: Vec<Option<(usize, i8, i8)>> = vec![None; groups.len()];
    if config.variation_merging {
        for i in 0..groups.len() {
            for j in 0..i {
                if merged_into[j].is_some() || groups[j].len != groups[i].len {
                    continue;
                }
                let base = &cells[groups[j].positions[0]..groups[j].positions[0] + groups[j].len];
                let other = &cells[groups[i].positions[0]..groups[i].positions[0] + groups[i].len];
                if let Some((transpose, volume_delta)) =
                    uniform_delta(base, other, channel, config)
                {
                    merged_into[i] = Some((j, transpose, volume_delta));
                    break;
                }
            }
        }
    }

    let mut ids: Vec<Option<u32>> = vec![None; groups.len()];
    for (k, group) in groups.iter().enumerate() {
        if merged_into[k].is_none() {
            let first = group.positions[0];
            ids[k] = Some(library.intern(&cells[first..first + group.len]));
        }
    }

    let mut refs: Vec<PatternReference> = Vec::new();
    let mut covered = vec![false; cells.len()];
    for (k, group) in groups.iter().enumerate() {
        let (pattern_id, transpose, volume_delta) = match merged_into[k] {
            Some((j, transpose, volume_delta)) => (ids[j].unwrap(), transpose, volume_delta),
            None => (ids[k].unwrap(), 0, 0),
        };
        for &pos in &group.positions {
            refs.push(PatternReference {
                frame: pos as u32,
                pattern_id,
                transpose,
                volume_delta,
            });
            covered[pos..pos + group.len].iter_mut().for_each(|c| *c = true);
        }
    }
    refs.sort_by_key(|r| r.frame);

    let residual = cells
        .iter()
        .enumerate()
        .filter(|(frame, _)| !covered[*frame])
        .map(|(frame, cell)| (frame as u32, *cell))
        .collect();

    CompressedChannel {
        channel,
        refs,
        residual,
    }
}

/// Find the uniform `(transpose, volume delta)` mapping `base` onto
/// `other`, verified cell-for-cell so reconstruction stays exact.
pub(crate) fn uniform_delta(
    base: &[FrameCell],
    other: &[FrameCell],
    channel: crate::nes::Channel,
    config: &CompileConfig,
) -> Option<(i8, i8)> {
    if base.len() != other.len() {
        return None;
    }
    let (first_base, first_other) = base
        .iter()
        .zip(other.iter())
        .find(|(a, b)| a.note.is_some() && b.note.is_some())
        .map(|(a, b)| (a, b))?;

    let transpose = if channel.is_melodic() {
        i16::from(first_other.note?) - i16::from(first_base.note?)
    } else {
        0
    };
    let volume_delta = if channel.has_volume_control() {
        i16::from(first_other.volume) - i16::from(first_base.volume)
    } else {
        0
    };
    if transpose.unsigned_abs() > config.max_transpose.unsigned_abs() as u16
        || volume_delta.unsigned_abs() > config.max_volume_delta.unsigned_abs() as u16
    {
        return None;
    }
    let transpose = transpose as i8;
    let volume_delta = volume_delta as i8;
    if transpose == 0 && volume_delta == 0 {
        return None;
    }

    // The driver applies deltas with plain adds, so every cell must stay
    // inside its field range without clamping.
    let exact = base.iter().zip(other.iter()).all(|(a, b)| {
        if let Some(note) = a.note {
            let shifted = i16::from(note) + i16::from(transpose);
            let volume = i16::from(a.volume) + i16::from(volume_delta);
            if !(0..=127).contains(&shifted) || !(0..=15).contains(&volume) {
                return false;
            }
        }
        transform_cell(*a, channel, transpose, volume_delta) == *b
    });
    exact.then_some((transpose, volume_delta))
}

/// Evenly spaced segment ranges covering at most `cap` frames in total.
fn stratified_segments(total: usize, cap: usize) -> Vec<std::ops::Range<usize>> {
    const SEGMENTS: usize = 8;
    let seg_len = (cap / SEGMENTS).max(1);
    let stride = total / SEGMENTS;
    (0..SEGMENTS)
        .map(|i| {
            let start = i * stride;
            start..(start + seg_len).min(total)
        })
        .filter(|r| r.len() > 1)
        .collect()
}

/// Compress a full timeline against an existing library: greedy longest
/// match at each position, lowest id on ties.
pub(crate) fn dictionary_pass(
    timeline: &ChannelTimeline,
    library: &PatternLibrary,
    config: &CompileConfig,
) -> CompressedChannel {
    let cells = &timeline.cells;
    let mut lengths: Vec<usize> = library
        .iter()
        .map(|p| p.len())
        .filter(|&l| l >= config.min_pattern_len)
        .collect();
    lengths.sort_unstable();
    lengths.dedup();
    lengths.reverse();

    let mut refs = Vec::new();
    let mut residual = Vec::new();
    let mut pos = 0usize;
    'outer: while pos < cells.len() {
        for &len in &lengths {
            if pos + len > cells.len() {
                continue;
            }
            if let Some(id) = library.find(&cells[pos..pos + len]) {
                refs.push(PatternReference {
                    frame: pos as u32,
                    pattern_id: id,
                    transpose: 0,
                    volume_delta: 0,
                });
                pos += len;
                continue 'outer;
            }
        }
        residual.push((pos as u32, cells[pos]));
        pos += 1;
    }

    CompressedChannel {
        channel: timeline.channel,
        refs,
        residual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::frame_gen::pulse_control;
    use crate::nes::pitch_table::timer_for;
    use crate::nes::Channel;

    fn cell(note: u8, volume: u8) -> FrameCell {
        FrameCell {
            note: Some(note),
            volume,
            timer: timer_for(Channel::Pulse1, note),
            control: pulse_control(2, volume),
            retrigger: false,
        }
    }

    fn timeline(cells: Vec<FrameCell>) -> ChannelTimeline {
        ChannelTimeline {
            channel: Channel::Pulse1,
            cells,
        }
    }

    fn detect(timeline: &ChannelTimeline, config: &CompileConfig) -> (CompressedChannel, PatternLibrary) {
        let mut library = PatternLibrary::new();
        let mut diags = Diagnostics::new();
        let compressed = SerialDetector.detect(timeline, &mut library, config, &mut diags);
        (compressed, library)
    }

    fn repeating_timeline(motif: &[u8], reps: usize) -> ChannelTimeline {
        let mut cells = Vec::new();
        for _ in 0..reps {
            for &note in motif {
                cells.push(cell(note, 8));
            }
        }
        timeline(cells)
    }

    #[test]
    fn test_repeating_motif_compresses_to_one_pattern() {
        let source = repeating_timeline(&[60, 64, 67, 64], 16);
        let config = CompileConfig::default();
        let (compressed, library) = detect(&source, &config);
        assert!(!library.is_empty());
        assert!(compressed.residual.is_empty());
        // Everything reconstructs exactly.
        let rebuilt = compressed.decompress(&library, source.len());
        assert_eq!(rebuilt, source);
        // Compression actually paid off.
        assert!(compressed.encoded_cells(config.ref_overhead) < source.cells.len());
    }

    #[test]
    fn test_random_timeline_degenerates_to_residual() {
        // No window repeats: every frame unique.
        let cells: Vec<FrameCell> = (0..40).map(|i| cell(33 + (i % 76) as u8, (i % 16) as u8)).collect();
        let unique = timeline(cells);
        let config = CompileConfig::default();
        let (compressed, library) = detect(&unique, &config);
        assert!(library.is_empty());
        assert!(compressed.refs.is_empty());
        assert_eq!(compressed.residual.len(), 40);
        assert_eq!(compressed.decompress(&library, unique.len()), unique);
    }

    #[test]
    fn test_short_timeline_is_all_residual() {
        let source = timeline(vec![cell(60, 8), cell(62, 8)]);
        let (compressed, library) = detect(&source, &CompileConfig::default());
        assert!(compressed.refs.is_empty());
        assert_eq!(compressed.decompress(&library, 2), source);
    }

    #[test]
    fn test_references_do_not_overlap() {
        let source = repeating_timeline(&[60, 62, 64, 65, 67], 10);
        let config = CompileConfig::default();
        let (compressed, library) = detect(&source, &config);
        let mut last_end = 0u32;
        for reference in &compressed.refs {
            assert!(reference.frame >= last_end);
            last_end = reference.frame + library.get(reference.pattern_id).len() as u32;
        }
    }

    #[test]
    fn test_ids_canonical_by_length_then_position() {
        // Two distinct motifs; ids must follow (length, first position).
        let mut cells = Vec::new();
        for _ in 0..6 {
            for &n in &[60u8, 64, 67] {
                cells.push(cell(n, 8));
            }
        }
        for _ in 0..6 {
            for &n in &[40u8, 45, 47, 52] {
                cells.push(cell(n, 8));
            }
        }
        let source = timeline(cells);
        let (compressed, library) = detect(&source, &CompileConfig::default());
        assert_eq!(compressed.decompress(&library, source.len()), source);
        for pair in compressed.refs.windows(2) {
            if pair[0].pattern_id != pair[1].pattern_id {
                // The earlier-starting pattern got the smaller id.
                assert!(pair[0].pattern_id < pair[1].pattern_id);
            }
        }
    }

    #[test]
    fn test_variation_merging_by_transpose() {
        // A motif and its transposition up a fourth, each repeated.
        let mut cells = Vec::new();
        for _ in 0..4 {
            for &n in &[60u8, 62, 64] {
                cells.push(cell(n, 8));
            }
        }
        for _ in 0..4 {
            for &n in &[65u8, 67, 69] {
                cells.push(cell(n, 8));
            }
        }
        let source = timeline(cells);

        let mut config = CompileConfig::default();
        config.variation_merging = true;
        let (compressed, library) = detect(&source, &config);
        assert_eq!(compressed.decompress(&library, source.len()), source);

        let mut base_config = CompileConfig::default();
        base_config.variation_merging = false;
        let (_plain, plain_library) = detect(&source, &base_config);
        // Merging must not grow the library.
        assert!(library.len() <= plain_library.len());
        // Some reference carries the +5 transpose when a merge happened.
        if library.len() < plain_library.len() {
            assert!(compressed.refs.iter().any(|r| r.transpose == 5));
        }
    }

    #[test]
    fn test_uniform_delta_detection() {
        let config = CompileConfig::default();
        let base = vec![cell(60, 8), cell(62, 8), cell(64, 8)];
        let up5 = vec![cell(65, 8), cell(67, 8), cell(69, 8)];
        let quieter = vec![cell(60, 6), cell(62, 6), cell(64, 6)];
        let jumbled = vec![cell(65, 8), cell(68, 8), cell(69, 8)];
        assert_eq!(
            uniform_delta(&base, &up5, Channel::Pulse1, &config),
            Some((5, 0))
        );
        assert_eq!(
            uniform_delta(&base, &quieter, Channel::Pulse1, &config),
            Some((0, -2))
        );
        assert_eq!(uniform_delta(&base, &jumbled, Channel::Pulse1, &config), None);
        // Beyond the transpose limit.
        let far = vec![cell(74, 8), cell(76, 8), cell(78, 8)];
        assert_eq!(uniform_delta(&base, &far, Channel::Pulse1, &config), None);
    }

    #[test]
    fn test_sampled_path_still_roundtrips() {
        let mut config = CompileConfig::default();
        config.sample_cap = 200;
        let source = repeating_timeline(&[60, 64, 67, 64], 100);
        let (compressed, library) = detect(&source, &config);
        assert_eq!(compressed.decompress(&library, source.len()), source);
        assert!(!compressed.refs.is_empty());
    }

    #[test]
    fn test_long_repetition_compression_ratio() {
        // A 16-frame motif repeated hundreds of times collapses to one
        // pattern plus references, an order of magnitude smaller.
        let motif: Vec<u8> = vec![60, 60, 64, 64, 67, 67, 72, 72, 67, 67, 64, 64, 60, 60, 55, 55];
        let mut config = CompileConfig::default();
        config.sample_cap = 100_000;
        let source = repeating_timeline(&motif, 500);
        let (compressed, library) = detect(&source, &config);
        assert_eq!(compressed.decompress(&library, source.len()), source);
        assert_eq!(library.len(), 1);
        assert!(compressed.residual.is_empty());
        let encoded = compressed.encoded_cells(config.ref_overhead)
            + library.iter().map(|p| p.len()).sum::<usize>();
        assert!(
            encoded * 10 <= source.cells.len(),
            "encoded {} cells for {} source cells",
            encoded,
            source.cells.len()
        );
    }
}
