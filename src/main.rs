use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use midi2nes::config::CompileConfig;
use midi2nes::dpcm::DpcmIndex;
use midi2nes::midi::MidiSong;
use midi2nes::tracker::detector::{PatternDetect, SerialDetector};
use midi2nes::tracker::parallel::ParallelDetector;
use midi2nes::tracker::{CompileContext, PassthroughDetector};

#[derive(Parser, Debug)]
#[command(name = "midi2nes")]
#[command(version)]
#[command(about = "MIDI to NES ROM compiler", long_about = None)]
struct Args {
    /// Normalised MIDI event stream (JSON)
    input: PathBuf,

    /// Output assembly file
    output: PathBuf,

    /// Linker configuration output (defaults to the output path with a
    /// .cfg extension)
    #[arg(short = 'l', long)]
    linker_config: Option<PathBuf>,

    /// DPCM sample index (JSON)
    #[arg(short = 'd', long)]
    dpcm_index: Option<PathBuf>,

    /// Compiler configuration file (JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Disable pattern compression
    #[arg(long)]
    no_patterns: bool,

    /// Add the channel-activity debug overlay to the ROM
    #[arg(long)]
    debug_overlay: bool,

    /// Force the single-threaded pattern detector
    #[arg(long)]
    serial: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> midi2nes::Result<()> {
    let config = match &args.config {
        Some(path) => CompileConfig::from_path(path)?,
        None => CompileConfig::default(),
    };
    let song = MidiSong::from_path(&args.input)?;

    let mut cx = CompileContext::new(config.clone());
    if let Some(path) = &args.dpcm_index {
        cx = cx.with_dpcm(DpcmIndex::from_path(path)?);
    }

    let detector: Box<dyn PatternDetect> = if args.no_patterns {
        Box::new(PassthroughDetector)
    } else if args.serial {
        Box::new(SerialDetector)
    } else {
        Box::new(ParallelDetector::from_config(&config))
    };

    let cfg_path = args
        .linker_config
        .clone()
        .unwrap_or_else(|| args.output.with_extension("cfg"));

    let output = midi2nes::compile_to_files(
        &song,
        detector.as_ref(),
        cx,
        args.debug_overlay,
        &args.output,
        &cfg_path,
    )?;

    for diagnostic in output.diagnostics.iter() {
        eprintln!("warning: {}", diagnostic);
    }
    let stats = output.stats();
    eprintln!(
        "wrote {} ({} data bytes, {} mapper) and {}",
        args.output.display(),
        stats.data_bytes,
        stats.mapper.name(),
        cfg_path.display(),
    );
    Ok(())
}
