//! NTSC pitch tables
//!
//! The APU divides the CPU clock by the timer value written to a tone
//! channel's period registers: pulse output is CPU / (16 * (t + 1)),
//! triangle is CPU / (32 * (t + 1)). Timers are computed once per
//! process and read-only afterwards.

use once_cell::sync::Lazy;

use super::Channel;

/// NES CPU clock rate, NTSC.
pub const CPU_CLOCK_NTSC: u32 = 1_789_773;

/// Largest value an 11-bit timer can hold.
pub const TIMER_MAX: u16 = 0x07FF;

/// MIDI range the noise period scale maps from.
pub const NOISE_RANGE: (u8, u8) = (24, 60);

fn midi_to_freq(note: u8) -> f64 {
    440.0 * 2.0_f64.powf((f64::from(note) - 69.0) / 12.0)
}

fn build_table(divisor: f64) -> [u16; 128] {
    let mut table = [0u16; 128];
    for (note, slot) in table.iter_mut().enumerate() {
        let freq = midi_to_freq(note as u8);
        let timer = (f64::from(CPU_CLOCK_NTSC) / (divisor * freq) - 1.0) as i64;
        *slot = timer.clamp(0, i64::from(TIMER_MAX)) as u16;
    }
    table
}

/// Timer table for the pulse channels (divide-by-16 output).
pub static PULSE_TIMERS: Lazy<[u16; 128]> = Lazy::new(|| build_table(16.0));

/// Timer table for the triangle channel (divide-by-32 output), so the
/// written pitch is the sounding pitch.
pub static TRIANGLE_TIMERS: Lazy<[u16; 128]> = Lazy::new(|| build_table(32.0));

/// Playable MIDI range per channel; the low bound is the lowest note
/// whose timer still fits in 11 bits.
pub fn playable_range(channel: Channel) -> Option<(u8, u8)> {
    match channel {
        Channel::Pulse1 | Channel::Pulse2 => Some((33, 108)),
        Channel::Triangle => Some((21, 96)),
        Channel::Noise => Some(NOISE_RANGE),
        Channel::Dpcm => None,
    }
}

/// Timer value for a melodic channel at a given (in-range) MIDI note.
pub fn timer_for(channel: Channel, note: u8) -> u16 {
    match channel {
        Channel::Pulse1 | Channel::Pulse2 => PULSE_TIMERS[note as usize & 0x7F],
        Channel::Triangle => TRIANGLE_TIMERS[note as usize & 0x7F],
        _ => 0,
    }
}

/// Shift a note by octaves until it fits the range; None when no octave
/// of the pitch class fits.
pub fn shift_into_range(note: u8, lo: u8, hi: u8) -> Option<u8> {
    let mut n = i16::from(note);
    while n < i16::from(lo) {
        n += 12;
    }
    while n > i16::from(hi) {
        n -= 12;
    }
    (n >= i16::from(lo)).then_some(n as u8)
}

/// Map a MIDI note onto the 16-entry noise period table. Lower periods
/// run the shift register faster, so the scale is inverted to keep
/// higher notes brighter.
pub fn noise_period(note: u8) -> u8 {
    let (lo, hi) = NOISE_RANGE;
    let clamped = note.clamp(lo, hi);
    let scaled = (u16::from(clamped - lo) * 15) / u16::from(hi - lo);
    15 - scaled.min(15) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_middle_c_pulse_timer() {
        // 1789773 / (16 * 261.6256 Hz) - 1, truncated.
        assert_eq!(PULSE_TIMERS[60], 426);
    }

    #[test]
    fn test_a440_pulse_timer() {
        assert_eq!(PULSE_TIMERS[69], 253);
    }

    #[test]
    fn test_octave_halves_timer() {
        let c4 = PULSE_TIMERS[60] as f64;
        let c5 = PULSE_TIMERS[72] as f64;
        assert!((c4 / c5 - 2.0).abs() < 0.02);
    }

    #[test]
    fn test_pulse_low_bound_is_33() {
        // The lowest note whose timer fits in 11 bits.
        assert!(PULSE_TIMERS[33] <= TIMER_MAX);
        let raw_32 = f64::from(CPU_CLOCK_NTSC) / (16.0 * midi_to_freq(32)) - 1.0;
        assert!(raw_32 as u32 > u32::from(TIMER_MAX));
    }

    #[test]
    fn test_triangle_table_differs_from_pulse() {
        // Triangle divides by 32, so its timer for the same note is
        // roughly half the pulse timer.
        let pulse = PULSE_TIMERS[60] as f64;
        let triangle = TRIANGLE_TIMERS[60] as f64;
        assert!((pulse / triangle - 2.0).abs() < 0.02);
    }

    #[test]
    fn test_shift_into_range() {
        assert_eq!(shift_into_range(24, 33, 108), Some(36));
        assert_eq!(shift_into_range(60, 33, 108), Some(60));
        assert_eq!(shift_into_range(120, 33, 108), Some(108));
        assert_eq!(shift_into_range(112, 33, 108), Some(100));
    }

    #[test]
    fn test_noise_period_inverted() {
        assert_eq!(noise_period(24), 15);
        assert_eq!(noise_period(60), 0);
        assert!(noise_period(36) > noise_period(48));
        // Clamped outside the range.
        assert_eq!(noise_period(10), 15);
        assert_eq!(noise_period(90), 0);
    }
}
