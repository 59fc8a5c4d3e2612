use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::debug;

use tagvm::config::{CollectorKind, RuntimeConfig, StatsFormat};
use tagvm::loader::{self, EXIT_LOAD_FAILED, RunError};
use tagvm::vm::{EngineStats, disassemble};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CollectorArg {
    TrialDeletion,
    MarkSweep,
}

impl From<CollectorArg> for CollectorKind {
    fn from(arg: CollectorArg) -> Self {
        match arg {
            CollectorArg::TrialDeletion => CollectorKind::TrialDeletion,
            CollectorArg::MarkSweep => CollectorKind::MarkSweep,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "tagvm")]
#[command(about = "A bytecode engine for a dynamically typed scripting language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module image
    Run {
        /// The module image to run
        image: PathBuf,

        /// Opaque argument passed to the entry method as `this`
        arg: Option<String>,

        /// Application heap size in MiB (overrides TAGVM_HEAP_SIZE)
        #[arg(long, value_name = "MIB")]
        heap_size: Option<usize>,

        /// Cycle-collection backend
        #[arg(long, value_enum)]
        collector: Option<CollectorArg>,

        /// TOML file with runtime settings
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print GC statistics on exit (human or json)
        #[arg(
            long,
            value_enum,
            num_args = 0..=1,
            require_equals = true,
            default_missing_value = "human"
        )]
        gc_stats: Option<StatsFormatArg>,
    },
    /// Print a bytecode listing of a module image
    Disasm {
        /// The module image to list
        image: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            arg,
            heap_size,
            collector,
            config,
            gc_stats,
        } => {
            let config = match build_config(config.as_deref(), heap_size, collector, gc_stats) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_LOAD_FAILED);
                }
            };
            let stats_format = config.gc_stats;
            debug!("runtime config: {:?}", config);

            match loader::run_file(&image, arg.as_deref(), config) {
                Ok(report) => {
                    if let Some(line) = report.outcome.diagnostic() {
                        eprintln!("{}", line);
                    }
                    if let Some(format) = stats_format {
                        print_stats(&report.stats, format);
                    }
                    ExitCode::from(report.outcome.exit_code())
                }
                Err(RunError::Load(e)) => {
                    eprintln!("error: {}", e);
                    ExitCode::from(EXIT_LOAD_FAILED)
                }
                Err(RunError::Fatal(e)) => {
                    eprintln!("fatal: {}", e);
                    std::process::abort();
                }
            }
        }
        Commands::Disasm { image } => match loader::load_file(&image) {
            Ok(module) => {
                print!("{}", disassemble(&module));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::from(EXIT_LOAD_FAILED)
            }
        },
    }
}

/// Defaults, then the config file, then the environment, then flags.
fn build_config(
    file: Option<&Path>,
    heap_size: Option<usize>,
    collector: Option<CollectorArg>,
    gc_stats: Option<StatsFormatArg>,
) -> Result<RuntimeConfig, tagvm::config::ConfigError> {
    let mut config = match file {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env();
    if let Some(mib) = heap_size {
        config.set_heap_mib(mib);
    }
    if let Some(collector) = collector {
        config.collector = collector.into();
    }
    if let Some(format) = gc_stats {
        config.gc_stats = Some(format.into());
    }
    Ok(config)
}

fn print_stats(stats: &EngineStats, format: StatsFormat) {
    match format {
        StatsFormat::Json => match serde_json::to_string_pretty(stats) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("error: cannot encode stats: {}", e),
        },
        StatsFormat::Human => {
            let gc = &stats.gc;
            eprintln!(
                "[GC] Collector: {}, Released: {}, Cycle passes: {}, Cycle garbage: {}, Sweep passes: {}, Sweep garbage: {}",
                stats.collector, gc.released, gc.cycle_passes, gc.cycle_garbage, gc.sweep_passes, gc.sweep_garbage
            );
            eprintln!(
                "[GC] Live: {} strings, {} objects, {} envs; Peak candidates: {}",
                gc.strings_live, gc.objects_live, gc.envs_live, gc.peak_candidates
            );
            let app = &stats.arena.app;
            eprintln!(
                "[Arena] Live: {} bytes, Peak: {} bytes, High water: {}, Allocations: {}, Reused: {}",
                app.live_bytes, app.peak_live_bytes, app.high_water, app.allocations, app.reused
            );
            eprintln!(
                "[Cache] Hits: {}, Misses: {}; Handler frames: {}; Instructions: {}",
                stats.property_cache.hits,
                stats.property_cache.misses,
                stats.handler_frames_allocated,
                stats.instructions
            );
        }
    }
}
