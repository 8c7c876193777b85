//! rtsync CLI - drive the synchronization engine from the terminal.
//!
//! Manages the configuration file and replays scripted scenarios against
//! the engine over in-memory transports, printing what consumers would see.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use rt_core::config::AppConfig;
use rt_core::error::RtResult;
use rt_core::logging;

/// rtsync - hybrid push/polling real-time sync engine.
#[derive(Parser)]
#[command(
    name = "rtsync",
    version,
    about = "Real-time sync engine CLI",
    long_about = "A command-line driver for the rtsync engine.\n\
                  Inspect configuration and replay connection scenarios against in-memory transports."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output for scripting.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// View and initialize the configuration file.
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Replay a scenario file against the engine.
    Simulate {
        /// Scenario file (TOML).
        scenario: PathBuf,
        /// Run on the wall clock instead of virtual time.
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> RtResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_config_path()?,
    };
    // `config init` may point at a file that does not exist yet.
    let config = match &cli.config {
        Some(path) if path.exists() => AppConfig::load_from_file(path)?,
        Some(_) => AppConfig::default(),
        None => AppConfig::load_default()?,
    };

    let _guard = logging::init_from_config(&config.logging, cli.verbose.then_some("debug"))?;

    info!("rtsync CLI v{}", rt_core::constants::APP_VERSION);

    match cli.command {
        Commands::Config { action } => {
            commands::config::run(&config, &config_path, action, cli.format)
        }
        Commands::Simulate { scenario, realtime } => {
            commands::simulate::run(&config, &scenario, realtime, cli.format).await
        }
    }
}
