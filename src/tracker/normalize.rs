//! Event normaliser
//!
//! Pairs note-on/off events into frame-stamped `NoteEvent`s and
//! summarises each track for the channel mapper.

use std::collections::HashMap;

use tracing::debug;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::dpcm;
use crate::error::{Error, Result};
use crate::midi::{EventKind, MidiTrack, PERCUSSION_CHANNEL};
use crate::tracker::tempo_map::{TempoMap, FRAME_RATE_HZ};

const STAGE: &str = "normalize";

/// Fraction of note events allowed to be unpaired before the file is
/// considered malformed.
const UNPAIRED_LIMIT_PERCENT: usize = 5;

/// One note on the 60 Hz grid. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub frame: u32,
    pub midi_note: u8,
    pub velocity: u8,
    pub duration_frames: u32,
}

impl NoteEvent {
    pub fn end_frame(&self) -> u32 {
        self.frame + self.duration_frames
    }
}

/// Per-track statistics consumed by the channel mapper.
#[derive(Debug, Clone)]
pub struct TrackSummary {
    pub name: String,
    pub average_pitch: f32,
    pub pitch_min: u8,
    pub pitch_max: u8,
    /// Notes per second over the track's active span.
    pub note_density: f32,
    pub max_polyphony: usize,
    pub percussion: bool,
}

#[derive(Debug, Clone)]
pub struct NormalizedTrack {
    pub events: Vec<NoteEvent>,
    pub summary: TrackSummary,
}

impl NormalizedTrack {
    pub fn end_frame(&self) -> u32 {
        self.events.iter().map(NoteEvent::end_frame).max().unwrap_or(0)
    }
}

/// Pair a track's note events onto the frame grid.
pub fn normalize_track(
    track: &MidiTrack,
    tempo_map: &TempoMap,
    diagnostics: &mut Diagnostics,
) -> Result<NormalizedTrack> {
    let mut events: Vec<NoteEvent> = Vec::new();
    // note -> (start frame, velocity)
    let mut sounding: HashMap<u8, (u32, u8)> = HashMap::new();
    let mut unmatched = 0usize;
    let mut all_percussion_channel = true;
    let mut all_drum_mapped = true;
    let mut saw_note = false;
    let mut last_frame = 0u32;

    for event in &track.events {
        let frame = tempo_map.tick_to_frame(event.tick);
        last_frame = last_frame.max(frame);
        match event.kind {
            EventKind::NoteOn { note, velocity, channel } if velocity > 0 => {
                saw_note = true;
                all_percussion_channel &= channel == PERCUSSION_CHANNEL;
                all_drum_mapped &= dpcm::drum_slot(note).is_some();
                if sounding.contains_key(&note) {
                    // The pitch is already sounding; the earlier note
                    // keeps going and this onset is dropped.
                    diagnostics.record_track(
                        STAGE,
                        DiagnosticKind::OverlappingNoteOn,
                        &track.name,
                        format!("note {} re-struck at frame {} while sounding", note, frame),
                    );
                } else {
                    sounding.insert(note, (frame, velocity));
                }
            }
            EventKind::NoteOn { note, .. } | EventKind::NoteOff { note, .. } => {
                // Velocity-0 note-on is a note-off by MIDI convention.
                match sounding.remove(&note) {
                    Some((start, velocity)) => {
                        let duration = frame.saturating_sub(start).max(1);
                        events.push(NoteEvent {
                            frame: start,
                            midi_note: note,
                            velocity,
                            duration_frames: duration,
                        });
                    }
                    None => {
                        unmatched += 1;
                        diagnostics.record_track(
                            STAGE,
                            DiagnosticKind::UnmatchedNoteOff,
                            &track.name,
                            format!("note-off for silent note {} at frame {}", note, frame),
                        );
                    }
                }
            }
            EventKind::Tempo { .. } => {}
        }
    }

    // Notes never closed get clipped to the end of the track.
    let mut dangling: Vec<(u8, (u32, u8))> = sounding.into_iter().collect();
    dangling.sort_by_key(|(note, (start, _))| (*start, *note));
    for (note, (start, velocity)) in dangling {
        unmatched += 1;
        let duration = last_frame.saturating_sub(start).max(1);
        diagnostics.record_track(
            STAGE,
            DiagnosticKind::UnterminatedNote,
            &track.name,
            format!("note {} never released; clipped to frame {}", note, start + duration),
        );
        events.push(NoteEvent {
            frame: start,
            midi_note: note,
            velocity,
            duration_frames: duration,
        });
    }

    let total = track.note_event_count();
    if total > 0 && unmatched * 100 > total * UNPAIRED_LIMIT_PERCENT {
        return Err(Error::UnpairedEventsExceedThreshold {
            track: track.name.clone(),
            unmatched,
            total,
        });
    }

    events.sort_by_key(|e| (e.frame, e.midi_note));
    let summary = summarize(
        &track.name,
        &events,
        saw_note && (all_percussion_channel || all_drum_mapped),
    );
    debug!(
        track = %track.name,
        notes = events.len(),
        percussion = summary.percussion,
        "normalised track"
    );

    Ok(NormalizedTrack { events, summary })
}

fn summarize(name: &str, events: &[NoteEvent], percussion: bool) -> TrackSummary {
    if events.is_empty() {
        return TrackSummary {
            name: name.to_string(),
            average_pitch: 0.0,
            pitch_min: 0,
            pitch_max: 0,
            note_density: 0.0,
            max_polyphony: 0,
            percussion: false,
        };
    }

    let sum: u32 = events.iter().map(|e| u32::from(e.midi_note)).sum();
    let pitch_min = events.iter().map(|e| e.midi_note).min().unwrap();
    let pitch_max = events.iter().map(|e| e.midi_note).max().unwrap();

    let first = events.iter().map(|e| e.frame).min().unwrap();
    let last = events.iter().map(NoteEvent::end_frame).max().unwrap();
    let span_seconds = f64::from(last.saturating_sub(first).max(1)) / f64::from(FRAME_RATE_HZ);
    let density = events.len() as f64 / span_seconds;

    TrackSummary {
        name: name.to_string(),
        average_pitch: sum as f32 / events.len() as f32,
        pitch_min,
        pitch_max,
        note_density: density as f32,
        max_polyphony: max_polyphony(events),
        percussion,
    }
}

/// Largest number of simultaneously sounding notes.
fn max_polyphony(events: &[NoteEvent]) -> usize {
    // Closing edges sort before opening edges at the same frame.
    let mut edges: Vec<(u32, i32)> = Vec::with_capacity(events.len() * 2);
    for e in events {
        edges.push((e.frame, 1));
        edges.push((e.end_frame(), -1));
    }
    edges.sort_by_key(|&(frame, delta)| (frame, delta));
    let mut current = 0i32;
    let mut peak = 0i32;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak as usize
}
