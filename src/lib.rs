pub mod config;
pub mod diagnostics;
pub mod dpcm;
pub mod emitter;
pub mod error;
pub mod midi;
pub mod nes;
pub mod tracker;

use std::path::Path;

use tracing::warn;

pub use config::CompileConfig;
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};

use diagnostics::DiagnosticKind;
use emitter::{Artifacts, EmitStats};
use midi::MidiSong;
use tracker::detector::PatternDetect;
use tracker::pattern::SongModule;
use tracker::CompileContext;

/// Everything a successful compile produces.
pub struct CompileOutput {
    pub module: SongModule,
    pub artifacts: Artifacts,
    pub diagnostics: Diagnostics,
}

impl CompileOutput {
    pub fn stats(&self) -> EmitStats {
        self.artifacts.stats
    }
}

/// Run the full pipeline: event stream to assembly and linker config.
///
/// When the encoded song exceeds the mapper's capacity, detection is
/// re-run once with aggressive compression settings before the size
/// error is surfaced.
pub fn compile(
    song: &MidiSong,
    detector: &dyn PatternDetect,
    mut cx: CompileContext,
    debug_overlay: bool,
) -> Result<CompileOutput> {
    let module = tracker::compile_song(song, detector, &mut cx)?;
    match emitter::emit_module(&module, cx.dpcm_index.as_ref(), &cx.config, debug_overlay) {
        Ok(artifacts) => Ok(CompileOutput {
            module,
            artifacts,
            diagnostics: cx.diagnostics,
        }),
        Err(Error::RomSizeExceeded { got, capacity, .. }) => {
            warn!(
                got,
                capacity, "encoded song too large; retrying with aggressive compression"
            );
            cx.diagnostics.record(
                "emit",
                DiagnosticKind::AggressiveRecompress,
                format!("{} bytes over a {} byte budget", got, capacity),
            );
            cx.config = cx.config.aggressive();
            let module = tracker::compile_song(song, detector, &mut cx)?;
            let artifacts =
                emitter::emit_module(&module, cx.dpcm_index.as_ref(), &cx.config, debug_overlay)?;
            Ok(CompileOutput {
                module,
                artifacts,
                diagnostics: cx.diagnostics,
            })
        }
        Err(e) => Err(e),
    }
}

/// Compile and write both artifacts atomically. No files are touched
/// when any stage fails.
pub fn compile_to_files(
    song: &MidiSong,
    detector: &dyn PatternDetect,
    cx: CompileContext,
    debug_overlay: bool,
    asm_path: &Path,
    cfg_path: &Path,
) -> Result<CompileOutput> {
    let output = compile(song, detector, cx, debug_overlay)?;
    emitter::write_artifacts(&output.artifacts, asm_path, cfg_path)?;
    Ok(output)
}
