//! DPCM sample index and drum mapping
//!
//! The caller supplies a JSON mapping from drum-kit slot to sample
//! metadata; the compiler references slots by integer index and never
//! decodes audio.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Highest rate index the $4010 register accepts.
pub const MAX_RATE_INDEX: u8 = 15;

/// DPCM sample data must live at $C000 + addr*64 and be len*16+1 bytes.
pub const MAX_SAMPLE_BYTES: u32 = 4081;

/// Metadata for one drum-kit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DpcmSample {
    pub sample_bytes: u32,
    pub sample_rate_index: u8,
    #[serde(default)]
    pub loop_flag: bool,
}

impl DpcmSample {
    /// $4013 length byte: (bytes - 1) / 16.
    pub fn length_byte(&self) -> u8 {
        (self.sample_bytes.saturating_sub(1) / 16) as u8
    }

    /// $4010 control byte: loop flag bit 6, rate in the low nibble.
    pub fn control_byte(&self) -> u8 {
        (u8::from(self.loop_flag) << 6) | (self.sample_rate_index & 0x0F)
    }
}

/// Slot-indexed sample table.
#[derive(Debug, Clone, Default)]
pub struct DpcmIndex {
    samples: BTreeMap<u8, DpcmSample>,
}

impl DpcmIndex {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, DpcmSample> = serde_json::from_str(text)?;
        let mut samples = BTreeMap::new();
        for (key, sample) in raw {
            let slot: u8 = key.parse().map_err(|_| {
                Error::InvalidInput(format!("DPCM index: slot '{}' is not an integer", key))
            })?;
            if sample.sample_rate_index > MAX_RATE_INDEX {
                return Err(Error::InvalidInput(format!(
                    "DPCM index: slot {} rate index {} exceeds {}",
                    slot, sample.sample_rate_index, MAX_RATE_INDEX
                )));
            }
            if sample.sample_bytes == 0 || sample.sample_bytes > MAX_SAMPLE_BYTES {
                return Err(Error::InvalidInput(format!(
                    "DPCM index: slot {} sample of {} bytes is not playable",
                    slot, sample.sample_bytes
                )));
            }
            samples.insert(slot, sample);
        }
        Ok(Self { samples })
    }

    pub fn get(&self, slot: u8) -> Option<&DpcmSample> {
        self.samples.get(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Slots in ascending order, for stable table emission.
    pub fn slots(&self) -> impl Iterator<Item = (u8, &DpcmSample)> {
        self.samples.iter().map(|(slot, sample)| (*slot, sample))
    }

    /// Map a General-MIDI drum note to its sample slot, when the index
    /// holds one.
    pub fn slot_for_drum(&self, midi_note: u8) -> Option<u8> {
        let slot = drum_slot(midi_note)?;
        self.samples.contains_key(&slot).then_some(slot)
    }
}

/// General-MIDI drum map: percussion note to canonical kit slot.
///
/// Slots follow the kit order kick, snare, closed hat, open hat,
/// crash, ride.
pub fn drum_slot(midi_note: u8) -> Option<u8> {
    match midi_note {
        35 | 36 => Some(0),      // kick
        38 | 40 => Some(1),      // snare
        42 | 44 => Some(2),      // closed hi-hat
        46 => Some(3),           // open hi-hat
        49 | 57 => Some(4),      // crash
        51 | 59 => Some(5),      // ride
        _ => None,
    }
}

/// Whether a note belongs to the General-MIDI percussion map at all.
pub fn is_drum_note(midi_note: u8) -> bool {
    (35..=81).contains(&midi_note)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_JSON: &str = r#"{
        "0": { "sample_bytes": 1201, "sample_rate_index": 15 },
        "1": { "sample_bytes": 801, "sample_rate_index": 14, "loop_flag": true }
    }"#;

    #[test]
    fn test_parse_index() {
        let index = DpcmIndex::from_json(INDEX_JSON).unwrap();
        let kick = index.get(0).unwrap();
        assert_eq!(kick.sample_bytes, 1201);
        assert_eq!(kick.length_byte(), 75);
        assert_eq!(kick.control_byte(), 0x0F);
        let snare = index.get(1).unwrap();
        assert_eq!(snare.control_byte(), 0x4E);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let result = DpcmIndex::from_json(r#"{ "0": { "sample_bytes": 17, "sample_rate_index": 16 } }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_oversized_sample_rejected() {
        let result =
            DpcmIndex::from_json(r#"{ "0": { "sample_bytes": 5000, "sample_rate_index": 0 } }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_drum_slot_lookup() {
        let index = DpcmIndex::from_json(INDEX_JSON).unwrap();
        assert_eq!(index.slot_for_drum(36), Some(0));
        assert_eq!(index.slot_for_drum(38), Some(1));
        // Hats are in the drum map but not in this index.
        assert_eq!(index.slot_for_drum(42), None);
        assert_eq!(index.slot_for_drum(60), None);
    }
}
