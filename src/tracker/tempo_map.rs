//! MIDI tick to 60 Hz frame conversion
//!
//! Frame positions are computed by accumulating exact `ticks * µs`
//! products per tempo segment and dividing once per lookup, so rounding
//! error never compounds over long pieces.

use crate::error::{Error, Result};

/// Playback frame rate: one frame per NTSC NMI.
pub const FRAME_RATE_HZ: u32 = 60;

/// Sanity range on incoming tempos.
pub const MIN_TEMPO_BPM: f64 = 20.0;
pub const MAX_TEMPO_BPM: f64 = 300.0;

/// One tempo change: microseconds per quarter note from `tick` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempoEntry {
    pub tick: u32,
    pub us_per_quarter: u32,
}

impl TempoEntry {
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / f64::from(self.us_per_quarter)
    }
}

/// Monotone mapping from MIDI tick to frame index.
#[derive(Debug, Clone)]
pub struct TempoMap {
    entries: Vec<TempoEntry>,
    ticks_per_quarter: u32,
    /// Cumulative `segment_ticks * µs_per_quarter` up to each entry.
    /// Units are µs·tick; dividing by ticks_per_quarter yields µs.
    cumulative: Vec<u64>,
}

impl TempoMap {
    pub fn build(entries: Vec<TempoEntry>, ticks_per_quarter: u32) -> Result<Self> {
        if ticks_per_quarter == 0 {
            return Err(Error::InvalidTempoMap(
                "ticks_per_quarter must be positive".to_string(),
            ));
        }
        let first = entries
            .first()
            .ok_or_else(|| Error::InvalidTempoMap("no tempo entries".to_string()))?;
        if first.tick != 0 {
            return Err(Error::InvalidTempoMap(format!(
                "initial tempo missing: first entry at tick {}",
                first.tick
            )));
        }
        for pair in entries.windows(2) {
            if pair[1].tick <= pair[0].tick {
                return Err(Error::InvalidTempoMap(format!(
                    "entries not strictly ordered at tick {}",
                    pair[1].tick
                )));
            }
        }
        for entry in &entries {
            if entry.us_per_quarter == 0 {
                return Err(Error::InvalidTempoMap(format!(
                    "non-positive tempo at tick {}",
                    entry.tick
                )));
            }
            let bpm = entry.bpm();
            if !(MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&bpm) {
                return Err(Error::InvalidTempoMap(format!(
                    "tempo {:.1} BPM at tick {} outside [{}, {}]",
                    bpm, entry.tick, MIN_TEMPO_BPM, MAX_TEMPO_BPM
                )));
            }
        }

        let mut cumulative = Vec::with_capacity(entries.len());
        let mut acc: u64 = 0;
        cumulative.push(0);
        for pair in entries.windows(2) {
            let segment_ticks = u64::from(pair[1].tick - pair[0].tick);
            acc += segment_ticks * u64::from(pair[0].us_per_quarter);
            cumulative.push(acc);
        }

        Ok(Self {
            entries,
            ticks_per_quarter,
            cumulative,
        })
    }

    pub fn ticks_per_quarter(&self) -> u32 {
        self.ticks_per_quarter
    }

    /// Index of the tempo segment containing a tick.
    fn segment_for_tick(&self, tick: u32) -> usize {
        match self.entries.binary_search_by_key(&tick, |e| e.tick) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    /// Tempo in effect at a tick.
    pub fn tempo_at(&self, tick: u32) -> u32 {
        self.entries[self.segment_for_tick(tick)].us_per_quarter
    }

    /// Exact elapsed time numerator at a tick, in µs·tick units.
    fn us_ticks_at(&self, tick: u32) -> u128 {
        let i = self.segment_for_tick(tick);
        let entry = self.entries[i];
        u128::from(self.cumulative[i])
            + u128::from(tick - entry.tick) * u128::from(entry.us_per_quarter)
    }

    /// Frame index for a tick. Rounds to nearest, ties to even, so the
    /// quantisation never drifts one way over a long piece.
    pub fn tick_to_frame(&self, tick: u32) -> u32 {
        let numerator = self.us_ticks_at(tick) * u128::from(FRAME_RATE_HZ);
        let denominator = 1_000_000u128 * u128::from(self.ticks_per_quarter);
        div_round_half_even(numerator, denominator) as u32
    }

    /// Tick for a frame index; a right inverse of `tick_to_frame` within
    /// one tick.
    pub fn frame_to_tick(&self, frame: u32) -> u32 {
        // µs·tick target for the frame, kept as an exact product.
        let target =
            u128::from(frame) * 1_000_000u128 * u128::from(self.ticks_per_quarter);

        // Find the segment whose time span contains the target.
        let mut i = self.entries.len() - 1;
        while i > 0 && u128::from(self.cumulative[i]) * u128::from(FRAME_RATE_HZ) > target {
            i -= 1;
        }
        let entry = self.entries[i];
        let base = u128::from(self.cumulative[i]) * u128::from(FRAME_RATE_HZ);
        let step = u128::from(entry.us_per_quarter) * u128::from(FRAME_RATE_HZ);
        let offset = div_round_half_even(target.saturating_sub(base), step);
        entry.tick + offset as u32
    }
}

/// Integer division rounding to nearest, ties to even.
fn div_round_half_even(numerator: u128, denominator: u128) -> u64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let doubled = remainder * 2;
    let round_up = match doubled.cmp(&denominator) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => quotient % 2 == 1,
        std::cmp::Ordering::Less => false,
    };
    (quotient + u128::from(round_up)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_map() -> TempoMap {
        // 120 BPM at 480 ticks per quarter: one quarter note = 30 frames.
        TempoMap::build(
            vec![TempoEntry {
                tick: 0,
                us_per_quarter: 500_000,
            }],
            480,
        )
        .unwrap()
    }

    #[test]
    fn test_quarter_note_is_thirty_frames() {
        let map = simple_map();
        assert_eq!(map.tick_to_frame(0), 0);
        assert_eq!(map.tick_to_frame(480), 30);
        assert_eq!(map.tick_to_frame(960), 60);
        assert_eq!(map.tick_to_frame(4 * 480), 120);
    }

    #[test]
    fn test_rounds_ties_to_even() {
        // 8 ticks = 0.5 frames exactly: rounds to 0 (even), while
        // 24 ticks = 1.5 frames rounds to 2.
        let map = simple_map();
        assert_eq!(map.tick_to_frame(8), 0);
        assert_eq!(map.tick_to_frame(24), 2);
    }

    #[test]
    fn test_monotone_across_tempo_change() {
        let map = TempoMap::build(
            vec![
                TempoEntry {
                    tick: 0,
                    us_per_quarter: 500_000,
                },
                TempoEntry {
                    tick: 960,
                    us_per_quarter: 250_000,
                },
            ],
            480,
        )
        .unwrap();
        let mut last = 0;
        for tick in (0..4000).step_by(7) {
            let frame = map.tick_to_frame(tick);
            assert!(frame >= last, "tick {} went backwards", tick);
            last = frame;
        }
        // After the change the rate doubles: 480 ticks become 15 frames.
        assert_eq!(map.tick_to_frame(960), 60);
        assert_eq!(map.tick_to_frame(1440), 75);
    }

    #[test]
    fn test_frame_to_tick_is_right_inverse() {
        let map = TempoMap::build(
            vec![
                TempoEntry {
                    tick: 0,
                    us_per_quarter: 500_000,
                },
                TempoEntry {
                    tick: 1920,
                    us_per_quarter: 400_000,
                },
            ],
            480,
        )
        .unwrap();
        for frame in 0..400 {
            let tick = map.frame_to_tick(frame);
            let back = map.tick_to_frame(tick);
            assert!(
                back.abs_diff(frame) <= 1,
                "frame {} -> tick {} -> frame {}",
                frame,
                tick,
                back
            );
        }
    }

    #[test]
    fn test_no_drift_over_long_piece() {
        // An hour of 120 BPM: 7200 quarters, exactly 216000 frames.
        let map = simple_map();
        assert_eq!(map.tick_to_frame(7200 * 480), 216_000);
    }

    #[test]
    fn test_build_rejects_bad_input() {
        assert!(matches!(
            TempoMap::build(vec![], 480),
            Err(Error::InvalidTempoMap(_))
        ));
        assert!(matches!(
            TempoMap::build(
                vec![TempoEntry {
                    tick: 10,
                    us_per_quarter: 500_000
                }],
                480
            ),
            Err(Error::InvalidTempoMap(_))
        ));
        assert!(matches!(
            TempoMap::build(
                vec![TempoEntry {
                    tick: 0,
                    us_per_quarter: 0
                }],
                480
            ),
            Err(Error::InvalidTempoMap(_))
        ));
        // 600 BPM is outside the sanity range.
        assert!(matches!(
            TempoMap::build(
                vec![TempoEntry {
                    tick: 0,
                    us_per_quarter: 100_000
                }],
                480
            ),
            Err(Error::InvalidTempoMap(_))
        ));
    }

    #[test]
    fn test_tempo_at() {
        let map = TempoMap::build(
            vec![
                TempoEntry {
                    tick: 0,
                    us_per_quarter: 500_000,
                },
                TempoEntry {
                    tick: 480,
                    us_per_quarter: 250_000,
                },
            ],
            480,
        )
        .unwrap();
        assert_eq!(map.tempo_at(0), 500_000);
        assert_eq!(map.tempo_at(479), 500_000);
        assert_eq!(map.tempo_at(480), 250_000);
        assert_eq!(map.tempo_at(10_000), 250_000);
    }

    #[test]
    fn test_div_round_half_even() {
        assert_eq!(div_round_half_even(10, 4), 2); // 2.5 -> 2
        assert_eq!(div_round_half_even(14, 4), 4); // 3.5 -> 4
        assert_eq!(div_round_half_even(9, 4), 2);
        assert_eq!(div_round_half_even(11, 4), 3);
    }
}
