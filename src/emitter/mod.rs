//! Code emitter
//!
//! Turns a `SongModule` into the pair of artifacts the external
//! toolchain consumes: a CA65 assembly source and an ld65 linker
//! configuration. Output files are written atomically so a failed
//! compile never leaves partial artifacts behind.

pub mod asm;
pub mod ines;
pub mod mapper;

use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::config::{CompileConfig, MapperChoice};
use crate::dpcm::DpcmIndex;
use crate::error::{Error, Result};
use crate::tracker::pattern::SongModule;

use asm::{data_size, emit_assembly, EmitOptions, DRIVER_CODE_BYTES};
use mapper::Mapper;

/// Size accounting for the emitted image.
#[derive(Debug, Clone, Copy)]
pub struct EmitStats {
    pub mapper: Mapper,
    pub data_bytes: usize,
    pub capacity: usize,
}

/// The emitter's output pair plus its accounting.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub assembly: String,
    pub linker_config: String,
    pub stats: EmitStats,
}

/// Pick the cartridge for a payload; Auto prefers NROM when it fits.
pub fn select_mapper(choice: MapperChoice, required_bytes: usize) -> Mapper {
    match choice {
        MapperChoice::Nrom => Mapper::Nrom,
        MapperChoice::Mmc1 => Mapper::Mmc1,
        MapperChoice::Auto => {
            if required_bytes <= Mapper::Nrom.data_capacity() {
                Mapper::Nrom
            } else {
                Mapper::Mmc1
            }
        }
    }
}

/// Serialise the module, enforcing the chosen mapper's PRG capacity.
pub fn emit_module(
    module: &SongModule,
    dpcm_index: Option<&DpcmIndex>,
    config: &CompileConfig,
    debug_overlay: bool,
) -> Result<Artifacts> {
    let data_bytes = data_size(module, dpcm_index);
    let required = data_bytes + DRIVER_CODE_BYTES;
    let mapper = select_mapper(config.mapper, required);
    let capacity = mapper.data_capacity();
    if required > capacity {
        return Err(Error::RomSizeExceeded {
            mapper: mapper.name(),
            got: required,
            capacity,
        });
    }

    let options = EmitOptions {
        mapper,
        debug_overlay,
    };
    let assembly = emit_assembly(module, dpcm_index, &options)?;
    info!(
        mapper = mapper.name(),
        data_bytes,
        capacity,
        patterns = module.library.len(),
        "emitted assembly"
    );
    Ok(Artifacts {
        assembly,
        linker_config: mapper.linker_config(),
        stats: EmitStats {
            mapper,
            data_bytes,
            capacity,
        },
    })
}

/// Write a file atomically: temp file in the target directory, then
/// rename over the destination.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut temp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    temp.write_all(contents.as_bytes())?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Write both artifacts; nothing is written unless both succeed in
/// serialisation beforehand.
pub fn write_artifacts(artifacts: &Artifacts, asm_path: &Path, cfg_path: &Path) -> Result<()> {
    write_atomic(asm_path, &artifacts.assembly)?;
    write_atomic(cfg_path, &artifacts.linker_config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::Channel;
    use crate::tracker::pattern::{CompressedChannel, PatternLibrary};

    fn empty_module() -> SongModule {
        SongModule {
            library: PatternLibrary::new(),
            channels: Channel::ALL
                .iter()
                .map(|&channel| CompressedChannel {
                    channel,
                    refs: Vec::new(),
                    residual: Vec::new(),
                })
                .collect(),
            total_frames: 0,
            frame_rate: 60,
            loop_frame: None,
        }
    }

    #[test]
    fn test_empty_module_emits_minimal_nrom() {
        let artifacts =
            emit_module(&empty_module(), None, &CompileConfig::default(), false).unwrap();
        assert_eq!(artifacts.stats.mapper, Mapper::Nrom);
        assert!(artifacts.assembly.contains("reset:"));
        assert!(artifacts.linker_config.contains("VECTORS"));
        assert!(artifacts.stats.data_bytes < 1024);
    }

    #[test]
    fn test_mapper_selection() {
        assert_eq!(select_mapper(MapperChoice::Auto, 1000), Mapper::Nrom);
        assert_eq!(select_mapper(MapperChoice::Auto, 100_000), Mapper::Mmc1);
        assert_eq!(select_mapper(MapperChoice::Nrom, 100_000), Mapper::Nrom);
        assert_eq!(select_mapper(MapperChoice::Mmc1, 10), Mapper::Mmc1);
    }

    #[test]
    fn test_capacity_enforced() {
        // A module whose residual alone exceeds NROM's data budget.
        let mut module = empty_module();
        let frames: u32 = 10_000;
        module.total_frames = frames;
        module.channels[0].residual = (0..frames)
            .map(|f| (f, Channel::Pulse1.silent_cell()))
            .collect();
        let mut config = CompileConfig::default();
        config.mapper = MapperChoice::Nrom;
        let result = emit_module(&module, None, &config, false);
        assert!(matches!(result, Err(Error::RomSizeExceeded { .. })));
        // Auto selection falls over to MMC1 instead.
        config.mapper = MapperChoice::Auto;
        let artifacts = emit_module(&module, None, &config, false).unwrap();
        assert_eq!(artifacts.stats.mapper, Mapper::Mmc1);
    }

    #[test]
    fn test_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("music.asm");
        write_atomic(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        write_atomic(&path, "replaced").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "replaced");
    }
}
