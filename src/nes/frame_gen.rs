//! Frame generator
//!
//! Expands mapped note events into dense 60 Hz timelines of APU register
//! state, one cell per channel per frame.

use tracing::debug;

use crate::config::CompileConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::dpcm::DpcmIndex;
use crate::error::Result;
use crate::nes::envelope::Adsr;
use crate::nes::pitch_table::{noise_period, playable_range, shift_into_range, timer_for};
use crate::nes::{Channel, ChannelTimeline, FrameCell, TRIANGLE_ACTIVE_CTRL};
use crate::tracker::normalize::NoteEvent;
use crate::tracker::track_mapper::ChannelAssignment;

const STAGE: &str = "frame-gen";

/// Build all five channel timelines covering frames `0..total_frames`.
pub fn generate_timelines(
    assignment: &ChannelAssignment,
    dpcm_index: Option<&DpcmIndex>,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<ChannelTimeline>> {
    let total_frames = assignment.end_frame();
    let mut timelines = Vec::with_capacity(Channel::ALL.len());
    for channel in Channel::ALL {
        let timeline = match channel {
            Channel::Pulse1 => melodic_timeline(
                channel,
                assignment.get(channel),
                total_frames,
                Adsr::from_choice(&config.envelopes.pulse1),
                config,
                diagnostics,
            ),
            Channel::Pulse2 => melodic_timeline(
                channel,
                assignment.get(channel),
                total_frames,
                Adsr::from_choice(&config.envelopes.pulse2),
                config,
                diagnostics,
            ),
            Channel::Triangle => melodic_timeline(
                channel,
                assignment.get(channel),
                total_frames,
                Adsr::CONSTANT,
                config,
                diagnostics,
            ),
            Channel::Noise => noise_timeline(
                assignment.get(channel),
                total_frames,
                Adsr::from_choice(&config.envelopes.noise),
                diagnostics,
            ),
            Channel::Dpcm => dpcm_timeline(
                assignment.get(channel),
                total_frames,
                dpcm_index,
                diagnostics,
            ),
        };
        debug!(
            channel = channel.name(),
            frames = timeline.len(),
            "generated timeline"
        );
        timelines.push(timeline);
    }
    Ok(timelines)
}

/// Resolve a note into the channel's playable range, recording a
/// diagnostic when it had to move or be dropped.
fn resolve_pitch(
    channel: Channel,
    event: &NoteEvent,
    diagnostics: &mut Diagnostics,
) -> Option<u8> {
    let (lo, hi) = playable_range(channel)?;
    if (lo..=hi).contains(&event.midi_note) {
        return Some(event.midi_note);
    }
    match shift_into_range(event.midi_note, lo, hi) {
        Some(shifted) => {
            diagnostics.record_frame(
                STAGE,
                DiagnosticKind::PitchOutOfRange,
                event.frame,
                format!(
                    "{}: note {} octave-shifted to {}",
                    channel.name(),
                    event.midi_note,
                    shifted
                ),
            );
            Some(shifted)
        }
        None => {
            diagnostics.record_frame(
                STAGE,
                DiagnosticKind::PitchOutOfRange,
                event.frame,
                format!(
                    "{}: note {} unrepresentable, dropped",
                    channel.name(),
                    event.midi_note
                ),
            );
            None
        }
    }
}

fn melodic_timeline(
    channel: Channel,
    events: &[NoteEvent],
    total_frames: u32,
    envelope: Adsr,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> ChannelTimeline {
    let mut timeline = ChannelTimeline::silent(channel, total_frames);
    for event in events {
        let Some(pitch) = resolve_pitch(channel, event, diagnostics) else {
            continue;
        };
        let timer = timer_for(channel, pitch);
        for offset in 0..event.duration_frames {
            let frame = (event.frame + offset) as usize;
            let Some(slot) = timeline.cells.get_mut(frame) else {
                break;
            };
            *slot = if channel.is_pulse() {
                let volume = envelope.volume(offset, event.duration_frames, event.velocity);
                FrameCell {
                    note: Some(pitch),
                    volume,
                    timer,
                    control: pulse_control(config.duty, volume),
                    retrigger: offset == 0,
                }
            } else {
                // Triangle output is on or off; no volume nibble.
                FrameCell {
                    note: Some(pitch),
                    volume: 15,
                    timer,
                    control: TRIANGLE_ACTIVE_CTRL,
                    retrigger: offset == 0,
                }
            };
        }
    }
    timeline
}

fn noise_timeline(
    events: &[NoteEvent],
    total_frames: u32,
    envelope: Adsr,
    _diagnostics: &mut Diagnostics,
) -> ChannelTimeline {
    let mut timeline = ChannelTimeline::silent(Channel::Noise, total_frames);
    for event in events {
        let period = noise_period(event.midi_note);
        for offset in 0..event.duration_frames {
            let frame = (event.frame + offset) as usize;
            let Some(slot) = timeline.cells.get_mut(frame) else {
                break;
            };
            let volume = envelope.volume(offset, event.duration_frames, event.velocity);
            *slot = FrameCell {
                note: Some(period),
                volume,
                timer: u16::from(period),
                control: 0x30 | (volume & 0x0F),
                retrigger: offset == 0,
            };
        }
    }
    timeline
}

fn dpcm_timeline(
    events: &[NoteEvent],
    total_frames: u32,
    dpcm_index: Option<&DpcmIndex>,
    diagnostics: &mut Diagnostics,
) -> ChannelTimeline {
    let mut timeline = ChannelTimeline::silent(Channel::Dpcm, total_frames);
    for event in events {
        let sample = dpcm_index.and_then(|index| index.get(event.midi_note));
        let Some(sample) = sample else {
            diagnostics.record_frame(
                STAGE,
                DiagnosticKind::UnmappedDrum,
                event.frame,
                format!("DPCM slot {} missing from the sample index", event.midi_note),
            );
            continue;
        };
        if let Some(slot) = timeline.cells.get_mut(event.frame as usize) {
            // The hardware plays the sample to completion; only the
            // trigger frame carries state.
            *slot = FrameCell {
                note: Some(event.midi_note),
                volume: 0,
                timer: u16::from(sample.control_byte()),
                control: sample.control_byte(),
                retrigger: true,
            };
        }
    }
    timeline
}

/// Pulse control byte: duty in bits 6-7, constant-volume flag, volume
/// nibble.
pub fn pulse_control(duty: u8, volume: u8) -> u8 {
    ((duty & 0x03) << 6) | 0x10 | (volume & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::PULSE_SILENT_CTRL;
    use crate::tracker::track_mapper::ChannelAssignment;

    fn assignment_with(channel: Channel, events: Vec<NoteEvent>) -> ChannelAssignment {
        let mut assignment = ChannelAssignment::default();
        assignment.set_for_test(channel, events);
        assignment
    }

    fn note(frame: u32, pitch: u8, velocity: u8, duration: u32) -> NoteEvent {
        NoteEvent {
            frame,
            midi_note: pitch,
            velocity,
            duration_frames: duration,
        }
    }

    #[test]
    fn test_middle_c_quarter_note() {
        // Scenario: middle C, velocity 64, 30 frames, then silence.
        let assignment = assignment_with(Channel::Pulse1, vec![note(0, 60, 64, 30)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let pulse1 = &timelines[Channel::Pulse1.index()];
        assert_eq!(pulse1.len(), 30);
        let first = pulse1.cells[0];
        assert_eq!(first.note, Some(60));
        assert_eq!(first.timer, 426);
        assert_eq!(first.control, 0x98);
        assert!(first.retrigger);
        for cell in &pulse1.cells[1..30] {
            assert_eq!(cell.note, Some(60));
            assert_eq!(cell.control, 0x98);
            assert!(!cell.retrigger);
        }
        assert!(diags.is_empty());
    }

    #[test]
    fn test_silence_between_notes_is_canonical() {
        let assignment = assignment_with(Channel::Pulse1, vec![note(0, 60, 64, 10), note(20, 62, 64, 10)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let pulse1 = &timelines[Channel::Pulse1.index()];
        for frame in 10..20 {
            assert_eq!(pulse1.cells[frame].control, PULSE_SILENT_CTRL);
            assert!(pulse1.cells[frame].is_silent());
        }
        assert!(pulse1.cells[20].retrigger);
    }

    #[test]
    fn test_triangle_silent_is_zero_not_eighty() {
        let assignment = assignment_with(Channel::Triangle, vec![note(0, 48, 100, 5)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let triangle = &timelines[Channel::Triangle.index()];
        assert_eq!(triangle.cells[0].control, 0xFF);
        assert_eq!(triangle.cells[0].volume, 15);
        // A trailing frame would be silent; extend by appending a rest
        // via a longer pulse channel.
        let assignment2 = {
            let mut a = assignment_with(Channel::Triangle, vec![note(0, 48, 100, 5)]);
            a.set_for_test(Channel::Pulse1, vec![note(0, 60, 64, 10)]);
            a
        };
        let timelines2 = generate_timelines(
            &assignment2,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let triangle2 = &timelines2[Channel::Triangle.index()];
        assert_eq!(triangle2.cells[5].control, 0x00);
    }

    #[test]
    fn test_low_note_octave_shifts_with_diagnostic() {
        // MIDI 24 sits below the pulse low bound of 33.
        let assignment = assignment_with(Channel::Pulse1, vec![note(0, 24, 64, 10)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let pulse1 = &timelines[Channel::Pulse1.index()];
        assert_eq!(pulse1.cells[0].note, Some(36));
        assert_eq!(diags.count_of(DiagnosticKind::PitchOutOfRange), 1);
    }

    #[test]
    fn test_lowest_encodable_pulse_pitch() {
        let assignment = assignment_with(Channel::Pulse1, vec![note(0, 33, 64, 4), note(10, 32, 64, 4)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let pulse1 = &timelines[Channel::Pulse1.index()];
        // Note 33 encodes in place, 32 shifts up an octave.
        assert_eq!(pulse1.cells[0].note, Some(33));
        assert_eq!(pulse1.cells[10].note, Some(44));
        assert_eq!(diags.count_of(DiagnosticKind::PitchOutOfRange), 1);
    }

    #[test]
    fn test_noise_cells_scale_period_and_volume() {
        let assignment = assignment_with(Channel::Noise, vec![note(0, 36, 127, 3)]);
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            None,
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let noise = &timelines[Channel::Noise.index()];
        assert_eq!(noise.cells[0].note, Some(noise_period(36)));
        assert_eq!(noise.cells[0].control, 0x30 | 15);
        assert!(noise.cells[0].retrigger);
    }

    #[test]
    fn test_dpcm_trigger_frame_only() {
        let index = DpcmIndex::from_json(
            r#"{ "0": { "sample_bytes": 1201, "sample_rate_index": 15 } }"#,
        )
        .unwrap();
        let assignment = {
            let mut a = assignment_with(Channel::Dpcm, vec![note(0, 0, 100, 10)]);
            a.set_for_test(Channel::Pulse1, vec![note(0, 60, 64, 10)]);
            a
        };
        let mut diags = Diagnostics::new();
        let timelines = generate_timelines(
            &assignment,
            Some(&index),
            &CompileConfig::default(),
            &mut diags,
        )
        .unwrap();
        let dpcm = &timelines[Channel::Dpcm.index()];
        assert_eq!(dpcm.cells[0].note, Some(0));
        assert_eq!(dpcm.cells[0].control, 0x0F);
        assert!(dpcm.cells[0].retrigger);
        assert!(dpcm.cells[1].is_silent());
    }

    #[test]
    fn test_pulse_control_encoding() {
        assert_eq!(pulse_control(2, 8), 0x98);
        assert_eq!(pulse_control(0, 0), 0x10);
        assert_eq!(pulse_control(3, 15), 0xDF);
    }
}
