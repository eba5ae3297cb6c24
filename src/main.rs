//! beammap command line.
//!
//! ```text
//! beammap map --config beammap.toml
//! beammap offsets --config beammap.toml --output offsets.txt
//! beammap home
//! beammap init-config beammap.toml
//! ```
//!
//! The binary drives the simulated bench described by the `[simulator]` section. Lab builds
//! plug their own `DeviceProvider` into the library instead.

use anyhow::{Context, Result};
use beammap::hardware::SimulatedBench;
use beammap::{go_home, record_zero_offsets, run_map, RunRequest, Settings};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const DEFAULT_FILTER: &str = "beammap=info";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to the defaults.
    #[arg(short, long, global = true, default_value = "beammap.toml")]
    config: PathBuf,

    /// Also write a daily log file into this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a beam map.
    Map(RunArgs),
    /// Record vector voltmeter zero offsets per frequency.
    Offsets(RunArgs),
    /// Send the stage home and exit.
    Home,
    /// Write the default configuration to a file.
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Output data file. Defaults to `beammap_<timestamp>.csv`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Header timestamp. Defaults to the local time.
    #[arg(long)]
    timestamp: Option<String>,
}

impl RunArgs {
    fn request(&self, prefix: &str, config: &Path) -> RunRequest {
        let timestamp = self
            .timestamp
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
        let output_path = self
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_{}.csv", prefix, timestamp)));
        RunRequest {
            output_path,
            timestamp,
            config_file: config.display().to_string(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    if let Command::InitConfig { path, force } = &cli.command {
        if path.exists() && !force {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
        Settings::write_default(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if !cli.config.exists() {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }
    let mut bench = SimulatedBench::from_config(&settings.simulator);

    match &cli.command {
        Command::Map(args) => {
            let summary = run_map(&settings, &mut bench, args.request("beammap", &cli.config)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Offsets(args) => {
            let summary =
                record_zero_offsets(&settings, &mut bench, args.request("offsets", &cli.config))
                    .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Home => go_home(&settings, &mut bench).await?,
        Command::InitConfig { .. } => {}
    }
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, plus an optional daily file.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let console = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "beammap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
