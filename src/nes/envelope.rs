//! ADSR volume envelopes
//!
//! Volume across a note is the product of an ADSR curve and the scaled
//! MIDI velocity, clamped to the APU's 4-bit range.

use crate::config::{AdsrSpec, EnvelopeChoice};

/// Envelope level ceiling (4-bit APU volume).
pub const MAX_LEVEL: u8 = 15;

/// ADSR curve with phase lengths in frames and a sustain level 0..=15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adsr {
    pub attack: u16,
    pub decay: u16,
    pub sustain: u8,
    pub release: u16,
}

impl Adsr {
    /// Constant envelope: full level for the whole note.
    pub const CONSTANT: Adsr = Adsr {
        attack: 0,
        decay: 0,
        sustain: 15,
        release: 0,
    };

    /// Named presets in the kit: default, piano, pad, pluck, percussion.
    pub fn preset(name: &str) -> Option<Adsr> {
        let (attack, decay, sustain, release) = match name {
            "default" => (0, 0, 15, 0),
            "piano" => (1, 3, 10, 2),
            "pad" => (5, 10, 8, 5),
            "pluck" => (0, 8, 0, 0),
            "percussion" => (0, 15, 0, 0),
            _ => return None,
        };
        Some(Adsr {
            attack,
            decay,
            sustain,
            release,
        })
    }

    pub fn from_choice(choice: &EnvelopeChoice) -> Adsr {
        match choice {
            EnvelopeChoice::Preset(name) => Adsr::preset(name).unwrap_or(Adsr::CONSTANT),
            EnvelopeChoice::Adsr(AdsrSpec {
                attack,
                decay,
                sustain,
                release,
            }) => Adsr {
                attack: *attack,
                decay: *decay,
                sustain: (*sustain).min(MAX_LEVEL),
                release: *release,
            },
        }
    }

    /// Curve level at a frame offset within a note of the given duration.
    pub fn level(&self, offset: u32, duration: u32) -> u8 {
        let attack_end = u32::from(self.attack);
        let decay_end = attack_end + u32::from(self.decay);
        let sustain_end = duration.saturating_sub(u32::from(self.release));

        let level = if offset < attack_end {
            // Ramp up from zero.
            (offset * u32::from(MAX_LEVEL)) / attack_end
        } else if offset < decay_end {
            // Ramp down to the sustain level.
            let progress = offset - attack_end;
            let span = u32::from(MAX_LEVEL - self.sustain);
            let decay = u32::from(self.decay);
            (u32::from(MAX_LEVEL) * decay - span * progress) / decay
        } else if offset < sustain_end {
            u32::from(self.sustain)
        } else if self.release == 0 || sustain_end >= duration {
            0
        } else {
            let progress = offset.saturating_sub(sustain_end);
            let remaining = u32::from(self.release).saturating_sub(progress);
            (u32::from(self.sustain) * remaining) / u32::from(self.release)
        };
        level.min(u32::from(MAX_LEVEL)) as u8
    }

    /// Final volume: envelope level scaled by MIDI velocity.
    pub fn volume(&self, offset: u32, duration: u32, velocity: u8) -> u8 {
        let level = u32::from(self.level(offset, duration));
        let scaled = u32::from(velocity_to_volume(velocity));
        ((level * scaled) / u32::from(MAX_LEVEL)).min(u32::from(MAX_LEVEL)) as u8
    }
}

/// Scale MIDI velocity 0..=127 onto the APU's 0..=15.
pub fn velocity_to_volume(velocity: u8) -> u8 {
    (velocity / 8).min(MAX_LEVEL)
}
