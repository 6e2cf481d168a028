//! Transcription pipeline
//!
//! Tempo map, event normaliser, channel mapper, frame generator and
//! pattern detector, chained by an explicit stage interface so any
//! stage (notably the pattern detector) can be swapped without touching
//! the ones upstream.

pub mod detector;
pub mod normalize;
pub mod parallel;
pub mod pattern;
pub mod tempo_map;
pub mod track_mapper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::CompileConfig;
use crate::diagnostics::Diagnostics;
use crate::dpcm::DpcmIndex;
use crate::error::{Error, Result};
use crate::midi::MidiSong;
use crate::nes::frame_gen::generate_timelines;
use crate::nes::{Channel, ChannelTimeline};
use detector::PatternDetect;
use normalize::{normalize_track, NormalizedTrack};
use pattern::{CompressedChannel, PatternLibrary, SongModule};
use tempo_map::{TempoMap, FRAME_RATE_HZ};
use track_mapper::{assign_channels, ChannelAssignment};

/// Shared state threaded through every stage: configuration going in,
/// diagnostics coming out.
pub struct CompileContext {
    pub config: CompileConfig,
    pub diagnostics: Diagnostics,
    pub dpcm_index: Option<DpcmIndex>,
    cancel: Option<Arc<AtomicBool>>,
}

impl CompileContext {
    pub fn new(config: CompileConfig) -> Self {
        Self {
            config,
            diagnostics: Diagnostics::new(),
            dpcm_index: None,
            cancel: None,
        }
    }

    pub fn with_dpcm(mut self, index: DpcmIndex) -> Self {
        self.dpcm_index = Some(index);
        self
    }

    /// Install a cooperative cancellation flag, checked between stages.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn checkpoint(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }
}

/// One pipeline stage. Stages are pure over their inputs; all shared
/// state lives in the context.
pub trait Stage<In, Out> {
    fn name(&self) -> &'static str;
    fn run(&self, input: In, cx: &mut CompileContext) -> Result<Out>;
}

/// Tempo map + event normaliser over every track.
pub struct NormalizeStage;

impl<'a> Stage<&'a MidiSong, Vec<NormalizedTrack>> for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn run(&self, song: &'a MidiSong, cx: &mut CompileContext) -> Result<Vec<NormalizedTrack>> {
        let tempo_map = TempoMap::build(song.tempo_entries(), song.ticks_per_quarter)?;
        let mut tracks = Vec::with_capacity(song.tracks.len());
        for track in &song.tracks {
            tracks.push(normalize_track(track, &tempo_map, &mut cx.diagnostics)?);
        }
        Ok(tracks)
    }
}

/// Channel mapper.
pub struct MapStage;

impl<'a> Stage<&'a [NormalizedTrack], ChannelAssignment> for MapStage {
    fn name(&self) -> &'static str {
        "channel-map"
    }

    fn run(
        &self,
        tracks: &'a [NormalizedTrack],
        cx: &mut CompileContext,
    ) -> Result<ChannelAssignment> {
        let config = cx.config.clone();
        assign_channels(tracks, cx.dpcm_index.as_ref(), &config, &mut cx.diagnostics)
    }
}

/// Frame generator.
pub struct FrameStage;

impl<'a> Stage<&'a ChannelAssignment, Vec<ChannelTimeline>> for FrameStage {
    fn name(&self) -> &'static str {
        "frame-gen"
    }

    fn run(
        &self,
        assignment: &'a ChannelAssignment,
        cx: &mut CompileContext,
    ) -> Result<Vec<ChannelTimeline>> {
        let config = cx.config.clone();
        generate_timelines(
            assignment,
            cx.dpcm_index.as_ref(),
            &config,
            &mut cx.diagnostics,
        )
    }
}

/// Pattern detection over all five channels, in fixed channel order so
/// pattern ids are reproducible, followed by the round-trip check.
pub struct DetectStage<'d> {
    pub detector: &'d dyn PatternDetect,
}

impl<'d> Stage<Vec<ChannelTimeline>, SongModule> for DetectStage<'d> {
    fn name(&self) -> &'static str {
        "pattern-detect"
    }

    fn run(&self, timelines: Vec<ChannelTimeline>, cx: &mut CompileContext) -> Result<SongModule> {
        let config = cx.config.clone();
        let mut library = PatternLibrary::new();
        let mut channels: Vec<CompressedChannel> = Vec::with_capacity(Channel::ALL.len());
        for timeline in &timelines {
            channels.push(self.detector.detect(
                timeline,
                &mut library,
                &config,
                &mut cx.diagnostics,
            ));
        }
        let total_frames = timelines.first().map(ChannelTimeline::len).unwrap_or(0);
        let module = SongModule {
            library,
            channels,
            total_frames,
            frame_rate: FRAME_RATE_HZ,
            loop_frame: config.loop_frame,
        };
        module.verify_roundtrip(&timelines)?;
        Ok(module)
    }
}

/// Detector that skips compression entirely: everything lands in the
/// residual. Used by the CLI's --no-patterns flag.
#[derive(Debug, Default)]
pub struct PassthroughDetector;

impl PatternDetect for PassthroughDetector {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn detect(
        &self,
        timeline: &ChannelTimeline,
        _library: &mut PatternLibrary,
        _config: &CompileConfig,
        _diagnostics: &mut Diagnostics,
    ) -> CompressedChannel {
        CompressedChannel::uncompressed(timeline)
    }
}

/// Run the whole transcription pipeline: event stream in, `SongModule`
/// out.
pub fn compile_song(
    song: &MidiSong,
    detector: &dyn PatternDetect,
    cx: &mut CompileContext,
) -> Result<SongModule> {
    cx.checkpoint()?;
    let tracks = NormalizeStage.run(song, cx)?;
    info!(tracks = tracks.len(), "normalised event stream");

    cx.checkpoint()?;
    let assignment = MapStage.run(&tracks, cx)?;

    cx.checkpoint()?;
    let timelines = FrameStage.run(&assignment, cx)?;
    info!(
        frames = timelines.first().map(ChannelTimeline::len).unwrap_or(0),
        "generated channel timelines"
    );

    cx.checkpoint()?;
    let module = DetectStage { detector }.run(timelines, cx)?;
    info!(
        patterns = module.library.len(),
        frames = module.total_frames,
        detector = detector.name(),
        "pattern detection finished"
    );
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{EventKind, MidiTrack, TrackEvent};
    use super::detector::SerialDetector;

    fn song_with_scale() -> MidiSong {
        // C major scale, eight quarter notes at 120 BPM.
        let scale = [60u8, 62, 64, 65, 67, 69, 71, 72];
        let mut events = vec![TrackEvent {
            tick: 0,
            kind: EventKind::Tempo {
                us_per_quarter: 500_000,
            },
        }];
        for (i, &note) in scale.iter().enumerate() {
            let tick = (i as u32) * 480;
            events.push(TrackEvent {
                tick,
                kind: EventKind::NoteOn {
                    note,
                    velocity: 64,
                    channel: 0,
                },
            });
            events.push(TrackEvent {
                tick: tick + 480,
                kind: EventKind::NoteOff { note, channel: 0 },
            });
        }
        events.sort_by_key(|e| e.tick);
        MidiSong {
            ticks_per_quarter: 480,
            tracks: vec![MidiTrack {
                name: "scale".into(),
                events,
            }],
        }
    }

    #[test]
    fn test_scale_compiles_to_240_frames() {
        let song = song_with_scale();
        let mut cx = CompileContext::new(CompileConfig::default());
        let module = compile_song(&song, &SerialDetector, &mut cx).unwrap();
        assert_eq!(module.total_frames, 240);
        assert_eq!(module.frame_rate, 60);
        // The scale sits on Pulse1; everything else stays silent.
        let pulse1 = module.decompress_channel(Channel::Pulse1);
        assert_eq!(pulse1.cells[0].note, Some(60));
        assert_eq!(pulse1.cells[239].note, Some(72));
        let triangle = module.decompress_channel(Channel::Triangle);
        assert!(triangle.cells.iter().all(|c| c.is_silent()));
    }

    #[test]
    fn test_zero_track_song_is_empty_module() {
        let song = MidiSong {
            ticks_per_quarter: 480,
            tracks: vec![],
        };
        let mut cx = CompileContext::new(CompileConfig::default());
        let module = compile_song(&song, &SerialDetector, &mut cx).unwrap();
        assert_eq!(module.total_frames, 0);
        assert!(module.library.is_empty());
        for channel in Channel::ALL {
            assert!(module.channel(channel).refs.is_empty());
            assert!(module.channel(channel).residual.is_empty());
        }
    }

    #[test]
    fn test_cancellation_between_stages() {
        let song = song_with_scale();
        let flag = Arc::new(AtomicBool::new(true));
        let mut cx = CompileContext::new(CompileConfig::default()).with_cancel_flag(flag);
        let result = compile_song(&song, &SerialDetector, &mut cx);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_passthrough_detector_keeps_everything_residual() {
        let song = song_with_scale();
        let mut cx = CompileContext::new(CompileConfig::default());
        let module = compile_song(&song, &PassthroughDetector, &mut cx).unwrap();
        assert!(module.library.is_empty());
        let pulse1 = module.channel(Channel::Pulse1);
        assert!(pulse1.refs.is_empty());
        assert_eq!(pulse1.residual.len(), 240);
    }

    #[test]
    fn test_identical_tracks_share_patterns() {
        // Two identical tracks land on Pulse1 and Pulse2 and share
        // pattern ids.
        let base = song_with_scale();
        let mut song = base.clone();
        let mut second = song.tracks[0].clone();
        second.name = "copy".into();
        song.tracks.push(second);

        let mut cx = CompileContext::new(CompileConfig::default());
        let module = compile_song(&song, &SerialDetector, &mut cx).unwrap();
        let p1 = module.channel(Channel::Pulse1);
        let p2 = module.channel(Channel::Pulse2);
        assert_eq!(
            module.decompress_channel(Channel::Pulse1).cells,
            module.decompress_channel(Channel::Pulse2).cells
        );
        let ids1: Vec<u32> = p1.refs.iter().map(|r| r.pattern_id).collect();
        let ids2: Vec<u32> = p2.refs.iter().map(|r| r.pattern_id).collect();
        assert_eq!(ids1, ids2);
    }
}
