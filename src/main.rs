//! phasetask - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use phasetask::demo::{run_demo, DemoOptions};
use phasetask::util::config::{parse_time_scale, resolve_config, ConfigFormat, RuntimeConfig};
use phasetask::util::logger::{self, LogLevel};
use phasetask::{build_scheduler, NAME, VERSION};

/// Phase-aware cooperative task runtime
#[derive(Parser, Debug)]
#[command(name = "phasetask")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (.ron or .json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a simulated host loop
    Demo {
        /// Maximum frames to simulate
        #[arg(long, default_value_t = 600)]
        frames: u32,

        /// Frame delta in milliseconds
        #[arg(long, default_value_t = 16)]
        delta_ms: u64,

        /// Worker pool size
        #[arg(long)]
        workers: Option<usize>,

        /// Time scale applied to scaled delays
        #[arg(long, value_parser = time_scale_arg)]
        time_scale: Option<f32>,
    },

    /// Print the effective configuration
    Config {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Ron)]
        format: Format,
    },

    /// Print version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Ron,
    Json,
}

impl From<Format> for ConfigFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Ron => ConfigFormat::Ron,
            Format::Json => ConfigFormat::Json,
        }
    }
}

fn time_scale_arg(value: &str) -> Result<f32, String> {
    parse_time_scale(value).ok_or_else(|| format!("{:?} is not a finite number", value))
}

fn load(args: &Args) -> Result<RuntimeConfig> {
    let config = resolve_config(args.config.as_deref()).context("Failed to load configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load(&args)?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.logging.level
    };
    logger::init_with_level(level);

    match args.command {
        Commands::Demo {
            frames,
            delta_ms,
            workers,
            time_scale,
        } => {
            if let Some(workers) = workers {
                config.pool.num_workers = workers;
            }
            if let Some(time_scale) = time_scale {
                config.scheduler.initial_time_scale = time_scale;
            }

            let scheduler = build_scheduler(&config)?;
            let options = DemoOptions {
                frames,
                delta: Duration::from_millis(delta_ms),
                ..DemoOptions::default()
            };
            let report = run_demo(&scheduler, &options)?;

            println!("frames run:          {}", report.frames_run);
            println!("pool sum:            {}", report.pool_sum);
            println!("resumed on host:     {}", report.resumed_on_host);
            println!("loaded bytes:        {}", report.loaded_bytes);
            println!("progress reports:    {:?}", report.progress);
            println!("coroutine steps:     {}", report.coroutine_steps);
            println!("owner work canceled: {}", report.owner_work_canceled);
        }
        Commands::Config { format } => {
            println!("{}", config.render(format.into())?);
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}
