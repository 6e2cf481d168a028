//! Normalised MIDI event stream
//!
//! The byte-level MIDI parser is an external collaborator; the compiler
//! consumes its output: per-track lists of note-on/off and tempo-change
//! events with tick stamps, plus the file's ticks-per-quarter resolution.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tracker::tempo_map::TempoEntry;

/// Default MIDI tempo: 120 BPM.
pub const DEFAULT_US_PER_QUARTER: u32 = 500_000;

/// MIDI channel carrying General-MIDI percussion (channel 10, zero-based 9).
pub const PERCUSSION_CHANNEL: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NoteOn {
        note: u8,
        velocity: u8,
        #[serde(default)]
        channel: u8,
    },
    NoteOff {
        note: u8,
        #[serde(default)]
        channel: u8,
    },
    Tempo {
        us_per_quarter: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TrackEvent {
    pub tick: u32,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MidiTrack {
    #[serde(default)]
    pub name: String,
    pub events: Vec<TrackEvent>,
}

impl MidiTrack {
    /// Number of note-on/off events (tempo markers excluded).
    pub fn note_event_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| !matches!(e.kind, EventKind::Tempo { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MidiSong {
    pub ticks_per_quarter: u32,
    pub tracks: Vec<MidiTrack>,
}

impl MidiSong {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let song: MidiSong = serde_json::from_reader(reader)?;
        song.validate()?;
        Ok(song)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open '{}': {}", path.display(), e),
            ))
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn validate(&self) -> Result<()> {
        if self.ticks_per_quarter == 0 {
            return Err(Error::InvalidInput(
                "ticks_per_quarter must be positive".to_string(),
            ));
        }
        for track in &self.tracks {
            let mut last_tick = 0;
            for event in &track.events {
                if event.tick < last_tick {
                    return Err(Error::InvalidInput(format!(
                        "track '{}': events not ordered by tick ({} after {})",
                        track.name, event.tick, last_tick
                    )));
                }
                last_tick = event.tick;
                if let EventKind::NoteOn { note, velocity, .. } = event.kind {
                    if note > 127 || velocity > 127 {
                        return Err(Error::InvalidInput(format!(
                            "track '{}': note {} velocity {} out of MIDI range",
                            track.name, note, velocity
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Collect tempo changes from all tracks into one ordered list.
    ///
    /// Guarantees a tick-0 entry: when the file carries none, the MIDI
    /// default of 120 BPM is inserted.
    pub fn tempo_entries(&self) -> Vec<TempoEntry> {
        let mut entries: Vec<TempoEntry> = self
            .tracks
            .iter()
            .flat_map(|t| t.events.iter())
            .filter_map(|e| match e.kind {
                EventKind::Tempo { us_per_quarter } => Some(TempoEntry {
                    tick: e.tick,
                    us_per_quarter,
                }),
                _ => None,
            })
            .collect();
        entries.sort_by_key(|e| e.tick);
        entries.dedup_by_key(|e| e.tick);
        if entries.first().map(|e| e.tick) != Some(0) {
            entries.insert(
                0,
                TempoEntry {
                    tick: 0,
                    us_per_quarter: DEFAULT_US_PER_QUARTER,
                },
            );
        }
        entries
    }
}
