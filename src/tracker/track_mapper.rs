//! Channel mapper
//!
//! Projects arbitrary MIDI tracks onto the NES's fixed channel set:
//! two pulse voices, one triangle, one noise, one DPCM. Monophony per
//! channel is a hard constraint, enforced here and validated before the
//! assignment leaves the stage.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::{ChannelHint, CompileConfig, ReduceStrategy};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::dpcm::DpcmIndex;
use crate::error::{Error, Result};
use crate::nes::Channel;
use crate::tracker::normalize::{NormalizedTrack, NoteEvent};

const STAGE: &str = "channel-map";

/// Note events per NES channel after polyphony reduction.
///
/// Invariant: within a channel, note intervals are pairwise disjoint.
#[derive(Debug, Clone, Default)]
pub struct ChannelAssignment {
    events: [Vec<NoteEvent>; 5],
}

impl ChannelAssignment {
    pub fn get(&self, channel: Channel) -> &[NoteEvent] {
        &self.events[channel.index()]
    }

    fn set(&mut self, channel: Channel, events: Vec<NoteEvent>) {
        self.events[channel.index()] = events;
    }

    #[cfg(test)]
    pub(crate) fn set_for_test(&mut self, channel: Channel, events: Vec<NoteEvent>) {
        self.set(channel, events);
    }

    /// Last sounding frame across all channels.
    pub fn end_frame(&self) -> u32 {
        self.events
            .iter()
            .flatten()
            .map(NoteEvent::end_frame)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.events.iter().all(Vec::is_empty)
    }

    /// Check the pairwise-disjoint interval invariant on every channel.
    pub fn validate(&self) -> Result<()> {
        for channel in Channel::ALL {
            let events = self.get(channel);
            for pair in events.windows(2) {
                if pair[1].frame < pair[0].end_frame() {
                    return Err(Error::InternalInvariant {
                        stage: STAGE,
                        message: format!(
                            "{}: overlapping notes at frames {} and {}",
                            channel.name(),
                            pair[0].frame,
                            pair[1].frame
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn hint_channel(hint: ChannelHint) -> Channel {
    match hint {
        ChannelHint::Pulse1 => Channel::Pulse1,
        ChannelHint::Pulse2 => Channel::Pulse2,
        ChannelHint::Triangle => Channel::Triangle,
        ChannelHint::Noise => Channel::Noise,
        ChannelHint::Dpcm => Channel::Dpcm,
    }
}

/// Assign normalised tracks to the five NES channels.
pub fn assign_channels(
    tracks: &[NormalizedTrack],
    dpcm_index: Option<&DpcmIndex>,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> Result<ChannelAssignment> {
    let mut assignment = ChannelAssignment::default();
    let mut claimed = [false; 5];

    let mut melodic: Vec<&NormalizedTrack> = Vec::new();
    let mut percussion: Vec<&NormalizedTrack> = Vec::new();
    let mut pinned: Vec<(&NormalizedTrack, Channel)> = Vec::new();

    for track in tracks {
        if track.events.is_empty() {
            continue;
        }
        let hint = config.hint_for(&track.summary.name);
        if let Some(channel) = hint.and_then(|h| h.channel).map(hint_channel) {
            pinned.push((track, channel));
        } else if track.summary.percussion {
            percussion.push(track);
        } else {
            melodic.push(track);
        }
    }

    // Explicitly pinned tracks claim their channels first.
    for (track, channel) in pinned {
        let required = config
            .hint_for(&track.summary.name)
            .map(|h| h.required)
            .unwrap_or(false);
        if claimed[channel.index()] {
            if required {
                return Err(Error::UnassignableTrack(track.summary.name.clone()));
            }
            diagnostics.record_track(
                STAGE,
                DiagnosticKind::DroppedTrack,
                &track.summary.name,
                format!("{} already claimed by another hint", channel.name()),
            );
            continue;
        }
        claimed[channel.index()] = true;
        match channel {
            Channel::Noise => {
                assignment.set(channel, reduce_noise(track, diagnostics));
            }
            Channel::Dpcm => {
                let (dpcm_events, _) =
                    route_percussion(track, dpcm_index, true, diagnostics);
                if dpcm_events.is_empty() && required {
                    return Err(Error::UnassignableTrack(track.summary.name.clone()));
                }
                assignment.set(channel, dpcm_events);
            }
            melodic_channel => {
                assignment.set(
                    melodic_channel,
                    reduce_for_channel(track, melodic_channel, config, diagnostics),
                );
            }
        }
    }

    let melodic_free: Vec<Channel> = [Channel::Pulse1, Channel::Pulse2, Channel::Triangle]
        .into_iter()
        .filter(|c| !claimed[c.index()])
        .collect();

    if melodic.len() == 1 && melodic_free.len() == 3 && wants_range_split(melodic[0], config) {
        // A lone polyphonic track spanning the full register: split it
        // by pitch band instead of collapsing to one voice.
        let track = melodic[0];
        info!(track = %track.summary.name, "splitting single polyphonic track by pitch range");
        let [high, mid, low] = range_split(&track.events, config);
        assignment.set(Channel::Pulse1, priority_reduce(high, true, diagnostics));
        assignment.set(Channel::Pulse2, priority_reduce(mid, true, diagnostics));
        assignment.set(Channel::Triangle, priority_reduce(low, false, diagnostics));
    } else {
        place_melodic(&mut assignment, &melodic, &melodic_free, config, diagnostics)?;
    }

    // Percussion routes to noise, or DPCM when a sample exists.
    if !percussion.is_empty() {
        let mut dpcm_all: Vec<NoteEvent> = Vec::new();
        let mut noise_all: Vec<NoteEvent> = Vec::new();
        for track in &percussion {
            let (dpcm_events, noise_events) =
                route_percussion(track, dpcm_index, false, diagnostics);
            dpcm_all.extend(dpcm_events);
            noise_all.extend(noise_events);
        }
        dpcm_all.sort_by_key(|e| (e.frame, e.midi_note));
        noise_all.sort_by_key(|e| (e.frame, e.midi_note));

        // DPCM wins when both fire on the same frame.
        let dpcm_starts: std::collections::BTreeSet<u32> =
            dpcm_all.iter().map(|e| e.frame).collect();
        noise_all.retain(|e| !dpcm_starts.contains(&e.frame));

        let dpcm_free = !claimed[Channel::Dpcm.index()];
        let noise_free = !claimed[Channel::Noise.index()];
        if dpcm_free {
            assignment.set(Channel::Dpcm, reduce_dpcm(dpcm_all, diagnostics));
        }
        if noise_free {
            assignment.set(Channel::Noise, priority_reduce(noise_all, true, diagnostics));
        }
        if !dpcm_free && !noise_free {
            for track in &percussion {
                if config
                    .hint_for(&track.summary.name)
                    .map(|h| h.required)
                    .unwrap_or(false)
                {
                    return Err(Error::UnassignableTrack(track.summary.name.clone()));
                }
                diagnostics.record_track(
                    STAGE,
                    DiagnosticKind::DroppedTrack,
                    &track.summary.name,
                    "both percussion channels already claimed",
                );
            }
        }
    }

    assignment.validate()?;
    Ok(assignment)
}

fn wants_range_split(track: &NormalizedTrack, config: &CompileConfig) -> bool {
    if let Some(hint) = config.hint_for(&track.summary.name) {
        if let Some(strategy) = hint.strategy {
            return strategy == ReduceStrategy::RangeSplit;
        }
    }
    track.summary.max_polyphony > 1
        && track.summary.pitch_max >= config.split_high
        && track.summary.pitch_min < config.split_mid
}

/// Assign melodic tracks by descending priority score.
fn place_melodic(
    assignment: &mut ChannelAssignment,
    melodic: &[&NormalizedTrack],
    free: &[Channel],
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> Result<()> {
    let mut scored: Vec<(&NormalizedTrack, f32)> = melodic
        .iter()
        .map(|t| (*t, priority_score(t, config)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut remaining: Vec<&NormalizedTrack> = scored.iter().map(|(t, _)| *t).collect();

    // Highest centroid takes Pulse1, next takes Pulse2.
    for channel in [Channel::Pulse1, Channel::Pulse2] {
        if !free.contains(&channel) || remaining.is_empty() {
            continue;
        }
        let track = remaining.remove(0);
        debug!(track = %track.summary.name, channel = channel.name(), "assigned melodic track");
        assignment.set(channel, reduce_for_channel(track, channel, config, diagnostics));
    }

    // The lowest centroid of what is left becomes the bass.
    if free.contains(&Channel::Triangle) && !remaining.is_empty() {
        let (lowest_idx, _) = remaining
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.summary
                    .average_pitch
                    .partial_cmp(&b.summary.average_pitch)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();
        let track = remaining.remove(lowest_idx);
        debug!(track = %track.summary.name, channel = "triangle", "assigned bass track");
        assignment.set(
            Channel::Triangle,
            reduce_for_channel(track, Channel::Triangle, config, diagnostics),
        );
    }

    // Leftovers either feed an arpeggio on Pulse2 or are dropped.
    for track in remaining {
        let hint = config.hint_for(&track.summary.name);
        if hint.and_then(|h| h.strategy) == Some(ReduceStrategy::Arpeggio)
            && free.contains(&Channel::Pulse2)
        {
            let mut merged = assignment.get(Channel::Pulse2).to_vec();
            merged.extend(track.events.iter().copied());
            merged.sort_by_key(|e| (e.frame, e.midi_note));
            let arpeggiated = arpeggiate(&merged, config.arpeggio_rate);
            assignment.set(
                Channel::Pulse2,
                priority_reduce(arpeggiated, true, diagnostics),
            );
            continue;
        }
        if hint.map(|h| h.required).unwrap_or(false) {
            return Err(Error::UnassignableTrack(track.summary.name.clone()));
        }
        diagnostics.record_track(
            STAGE,
            DiagnosticKind::DroppedTrack,
            &track.summary.name,
            "no melodic channel left",
        );
    }
    Ok(())
}

/// Pitch centroid dominates; density and user hints bias the order.
fn priority_score(track: &NormalizedTrack, config: &CompileConfig) -> f32 {
    let boost = config
        .hint_for(&track.summary.name)
        .map(|h| h.priority_boost)
        .unwrap_or(0.0);
    track.summary.average_pitch + track.summary.note_density.min(20.0) * 0.5 + boost
}

/// Reduce one track for one melodic channel by its configured strategy.
fn reduce_for_channel(
    track: &NormalizedTrack,
    channel: Channel,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> Vec<NoteEvent> {
    let keep_highest = channel != Channel::Triangle;
    let strategy = config
        .hint_for(&track.summary.name)
        .and_then(|h| h.strategy)
        .unwrap_or(ReduceStrategy::Priority);
    match strategy {
        ReduceStrategy::Priority | ReduceStrategy::RangeSplit => {
            priority_reduce(track.events.clone(), keep_highest, diagnostics)
        }
        ReduceStrategy::Arpeggio => {
            let arpeggiated = arpeggiate(&track.events, config.arpeggio_rate);
            priority_reduce(arpeggiated, keep_highest, diagnostics)
        }
    }
}

/// Keep one concurrent note per frame. Chords keep the preferred pitch;
/// a later onset truncates the sounding note (legato cut).
pub fn priority_reduce(
    mut events: Vec<NoteEvent>,
    keep_highest: bool,
    diagnostics: &mut Diagnostics,
) -> Vec<NoteEvent> {
    events.sort_by_key(|e| (e.frame, e.midi_note));
    let mut result: Vec<NoteEvent> = Vec::with_capacity(events.len());
    let mut dropped = 0usize;

    for event in events {
        if let Some(last) = result.last_mut() {
            if event.frame < last.end_frame() {
                if event.frame == last.frame {
                    // Same-onset chord: keep the preferred pitch.
                    // Events are pitch-ascending, so with keep_highest
                    // the newcomer wins.
                    if keep_highest {
                        *last = event;
                    }
                    dropped += 1;
                    continue;
                }
                // Later onset: cut the sounding note at the new attack.
                last.duration_frames = event.frame - last.frame;
            }
        }
        result.push(event);
    }

    if dropped > 0 {
        diagnostics.record(
            STAGE,
            DiagnosticKind::DroppedNote,
            format!("{} concurrent notes dropped during polyphony reduction", dropped),
        );
    }
    result
}

/// Partition events into [>= high, mid..high, < mid] pitch bands.
pub fn range_split(events: &[NoteEvent], config: &CompileConfig) -> [Vec<NoteEvent>; 3] {
    let mut high = Vec::new();
    let mut mid = Vec::new();
    let mut low = Vec::new();
    for event in events {
        if event.midi_note >= config.split_high {
            high.push(*event);
        } else if event.midi_note >= config.split_mid {
            mid.push(*event);
        } else {
            low.push(*event);
        }
    }
    [high, mid, low]
}

/// Cycle concurrent notes at a fixed rate, restarting on each chord.
pub fn arpeggiate(events: &[NoteEvent], rate: u32) -> Vec<NoteEvent> {
    let mut chords: BTreeMap<u32, Vec<NoteEvent>> = BTreeMap::new();
    for event in events {
        chords.entry(event.frame).or_default().push(*event);
    }
    let starts: Vec<u32> = chords.keys().copied().collect();
    let mut result = Vec::new();

    for (i, (&start, notes)) in chords.iter().enumerate() {
        let span_end = notes.iter().map(NoteEvent::end_frame).max().unwrap();
        let cutoff = match starts.get(i + 1) {
            Some(&next) => span_end.min(next),
            None => span_end,
        };
        if notes.len() == 1 {
            let mut event = notes[0];
            event.duration_frames = cutoff.saturating_sub(start).max(1);
            result.push(event);
            continue;
        }
        // Cycle order is descending pitch; the cycle restarts here, so
        // no state carries across chord changes.
        let mut cycle = notes.clone();
        cycle.sort_by_key(|e| std::cmp::Reverse(e.midi_note));
        let mut frame = start;
        let mut index = 0usize;
        while frame < cutoff {
            let source = cycle[index % cycle.len()];
            result.push(NoteEvent {
                frame,
                midi_note: source.midi_note,
                velocity: source.velocity,
                duration_frames: rate.min(cutoff - frame),
            });
            frame += rate;
            index += 1;
        }
    }
    result
}

/// Route one percussion track's hits to DPCM and noise lists.
fn route_percussion(
    track: &NormalizedTrack,
    dpcm_index: Option<&DpcmIndex>,
    dpcm_only: bool,
    diagnostics: &mut Diagnostics,
) -> (Vec<NoteEvent>, Vec<NoteEvent>) {
    let mut dpcm_events = Vec::new();
    let mut noise_events = Vec::new();
    for event in &track.events {
        let slot = dpcm_index.and_then(|index| index.slot_for_drum(event.midi_note));
        match slot {
            Some(slot) => dpcm_events.push(NoteEvent {
                frame: event.frame,
                midi_note: slot,
                velocity: event.velocity,
                duration_frames: event.duration_frames,
            }),
            None if dpcm_only => {
                diagnostics.record_track(
                    STAGE,
                    DiagnosticKind::UnmappedDrum,
                    &track.summary.name,
                    format!("drum note {} has no DPCM sample", event.midi_note),
                );
            }
            None => noise_events.push(*event),
        }
    }
    (dpcm_events, noise_events)
}

fn reduce_noise(track: &NormalizedTrack, diagnostics: &mut Diagnostics) -> Vec<NoteEvent> {
    priority_reduce(track.events.clone(), true, diagnostics)
}

/// DPCM monophony: on collision keep the louder hit, then the lower slot.
fn reduce_dpcm(mut events: Vec<NoteEvent>, diagnostics: &mut Diagnostics) -> Vec<NoteEvent> {
    events.sort_by_key(|e| (e.frame, std::cmp::Reverse(e.velocity), e.midi_note));
    let mut result: Vec<NoteEvent> = Vec::with_capacity(events.len());
    let mut dropped = 0usize;
    for event in events {
        if let Some(last) = result.last_mut() {
            if event.frame < last.end_frame() {
                if event.frame == last.frame {
                    dropped += 1;
                    continue;
                }
                last.duration_frames = event.frame - last.frame;
            }
        }
        result.push(event);
    }
    if dropped > 0 {
        diagnostics.record(
            STAGE,
            DiagnosticKind::DroppedNote,
            format!("{} simultaneous DPCM hits dropped", dropped),
        );
    }
    result
}
