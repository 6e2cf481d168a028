//! Compile-time configuration
//!
//! Every tunable of the pipeline lives here with its default, so a JSON
//! config file can override any subset via serde.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Polyphony-reduction strategy for one assigned track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceStrategy {
    /// Keep one concurrent note per frame (highest on pulse/noise,
    /// lowest on triangle).
    Priority,
    /// Partition concurrent notes across Pulse1/Pulse2/Triangle by pitch.
    RangeSplit,
    /// Cycle through concurrent notes at a fixed per-frame rate.
    Arpeggio,
}

/// Explicit channel request for a track hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHint {
    Pulse1,
    Pulse2,
    Triangle,
    Noise,
    Dpcm,
}

/// Per-track user hint, matched against the track name.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackHint {
    pub track: String,
    #[serde(default)]
    pub channel: Option<ChannelHint>,
    #[serde(default)]
    pub strategy: Option<ReduceStrategy>,
    /// When set, failure to place this track is a hard error instead of
    /// a dropped-track diagnostic.
    #[serde(default)]
    pub required: bool,
    /// Additive bias on the assignment priority score.
    #[serde(default)]
    pub priority_boost: f32,
}

/// Cartridge mapper selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MapperChoice {
    /// Pick NROM when the song fits in 32 KiB, MMC1 otherwise.
    #[default]
    Auto,
    Nrom,
    Mmc1,
}

/// ADSR envelope in frames; sustain is a level 0..=15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AdsrSpec {
    pub attack: u16,
    pub decay: u16,
    pub sustain: u8,
    pub release: u16,
}

/// Named envelope assignment for one channel: a preset name or an
/// explicit ADSR tuple.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeChoice {
    Preset(String),
    Adsr(AdsrSpec),
}

impl Default for EnvelopeChoice {
    fn default() -> Self {
        EnvelopeChoice::Preset("default".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub pulse1: EnvelopeChoice,
    pub pulse2: EnvelopeChoice,
    pub noise: EnvelopeChoice,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Pattern length bounds, inclusive.
    pub min_pattern_len: usize,
    pub max_pattern_len: usize,
    /// Cost of one pattern reference, in frame-cell units.
    pub ref_overhead: usize,
    /// Merge patterns that differ by a uniform transpose/volume delta.
    pub variation_merging: bool,
    /// Largest uniform transpose a merged variation may carry.
    pub max_transpose: i8,
    /// Largest uniform volume delta a merged variation may carry.
    pub max_volume_delta: i8,
    /// Above this many frames the detector works on a stratified sample.
    pub sample_cap: usize,
    /// Frames per note in an arpeggio cycle.
    pub arpeggio_rate: u32,
    /// Pitch-range split thresholds: >= high goes to Pulse1,
    /// mid..high to Pulse2, below mid to Triangle.
    pub split_high: u8,
    pub split_mid: u8,
    /// Default pulse duty cycle (0..=3).
    pub duty: u8,
    pub envelopes: EnvelopeConfig,
    pub mapper: MapperChoice,
    /// Frame the driver jumps back to at song end; None stops playback.
    pub loop_frame: Option<u32>,
    /// Pattern-detector worker count; 0 means available parallelism.
    pub workers: usize,
    /// Seconds before an enumeration chunk is retried serially.
    pub chunk_timeout_secs: u64,
    pub track_hints: Vec<TrackHint>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            min_pattern_len: 3,
            max_pattern_len: 32,
            ref_overhead: 2,
            variation_merging: false,
            max_transpose: 12,
            max_volume_delta: 4,
            sample_cap: 15_000,
            arpeggio_rate: 1,
            split_high: 60,
            split_mid: 48,
            duty: 2,
            envelopes: EnvelopeConfig::default(),
            mapper: MapperChoice::Auto,
            loop_frame: None,
            workers: 0,
            chunk_timeout_secs: 30,
            track_hints: Vec::new(),
        }
    }
}

impl CompileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: CompileConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_pattern_len < 2 || self.min_pattern_len > self.max_pattern_len {
            return Err(crate::Error::InvalidInput(format!(
                "pattern length bounds {}..={} are not usable",
                self.min_pattern_len, self.max_pattern_len
            )));
        }
        if self.duty > 3 {
            return Err(crate::Error::InvalidInput(format!(
                "duty cycle {} out of range 0..=3",
                self.duty
            )));
        }
        if self.split_mid >= self.split_high {
            return Err(crate::Error::InvalidInput(format!(
                "split thresholds mid={} high={} must be ordered",
                self.split_mid, self.split_high
            )));
        }
        if self.arpeggio_rate == 0 {
            return Err(crate::Error::InvalidInput(
                "arpeggio rate must be at least 1 frame".to_string(),
            ));
        }
        Ok(())
    }

    /// Find the hint matching a track name, if any.
    pub fn hint_for(&self, track: &str) -> Option<&TrackHint> {
        self.track_hints.iter().find(|h| h.track == track)
    }

    /// Tightened settings for the emitter's one retry after
    /// `RomSizeExceeded`.
    pub fn aggressive(&self) -> Self {
        let mut config = self.clone();
        config.variation_merging = true;
        config.sample_cap = config.sample_cap.min(8_000);
        config.ref_overhead = config.ref_overhead.min(1);
        config
    }
}
