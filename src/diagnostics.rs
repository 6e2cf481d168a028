//! Accumulating diagnostics channel
//!
//! Recoverable conditions (dropped events, out-of-range pitches, dropped
//! tracks) are recorded here and returned alongside the successful output.
//! They never abort a compile; fatal conditions go through `crate::Error`.

use std::fmt;

use tracing::warn;

/// What went wrong, at the level a caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A note-off arrived with no matching note-on.
    UnmatchedNoteOff,
    /// A note-on arrived while the same pitch was already sounding.
    OverlappingNoteOn,
    /// A note-on was never closed; its duration was clipped to track end.
    UnterminatedNote,
    /// A low-priority track could not be placed on any channel.
    DroppedTrack,
    /// A concurrent note was discarded during polyphony reduction.
    DroppedNote,
    /// A pitch was octave-shifted or dropped to fit the channel range.
    PitchOutOfRange,
    /// A percussion note had no DPCM sample and no noise mapping.
    UnmappedDrum,
    /// A pattern-detector chunk timed out twice and was abandoned.
    AbandonedChunk,
    /// The emitter re-ran pattern detection with aggressive settings.
    AggressiveRecompress,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnmatchedNoteOff => "unmatched-note-off",
            Self::OverlappingNoteOn => "overlapping-note-on",
            Self::UnterminatedNote => "unterminated-note",
            Self::DroppedTrack => "dropped-track",
            Self::DroppedNote => "dropped-note",
            Self::PitchOutOfRange => "pitch-out-of-range",
            Self::UnmappedDrum => "unmapped-drum",
            Self::AbandonedChunk => "abandoned-chunk",
            Self::AggressiveRecompress => "aggressive-recompress",
        }
    }
}

/// One recoverable condition with enough context to locate it.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Pipeline stage that recorded the condition.
    pub stage: &'static str,
    /// Source track name, when the condition is track-scoped.
    pub track: Option<String>,
    /// Frame index, when the condition is frame-scoped.
    pub frame: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.kind.as_str())?;
        if let Some(track) = &self.track {
            write!(f, " track={}", track)?;
        }
        if let Some(frame) = self.frame {
            write!(f, " frame={}", frame)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Ordered list of diagnostics gathered over a compile.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        warn!(target: "midi2nes::diagnostics", "{}", diagnostic);
        self.items.push(diagnostic);
    }

    /// Shorthand for the common stage/kind/message case.
    pub fn record(&mut self, stage: &'static str, kind: DiagnosticKind, message: impl Into<String>) {
        self.push(Diagnostic {
            kind,
            stage,
            track: None,
            frame: None,
            message: message.into(),
        });
    }

    pub fn record_track(
        &mut self,
        stage: &'static str,
        kind: DiagnosticKind,
        track: &str,
        message: impl Into<String>,
    ) {
        self.push(Diagnostic {
            kind,
            stage,
            track: Some(track.to_string()),
            frame: None,
            message: message.into(),
        });
    }

    pub fn record_frame(
        &mut self,
        stage: &'static str,
        kind: DiagnosticKind,
        frame: u32,
        message: impl Into<String>,
    ) {
        self.push(Diagnostic {
            kind,
            stage,
            track: None,
            frame: Some(frame),
            message: message.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_of(&self, kind: DiagnosticKind) -> usize {
        self.items.iter().filter(|d| d.kind == kind).count()
    }

    /// Merge another list into this one, preserving order.
    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }
}
