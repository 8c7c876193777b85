//! Config commands.

use std::path::Path;

use clap::Subcommand;
use console::style;

use rt_core::config::AppConfig;
use rt_core::error::{RtError, RtResult};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration.
    Show,
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file path.
    Path,
}

/// Run a config subcommand.
pub fn run(
    config: &AppConfig,
    config_path: &Path,
    action: ConfigAction,
    format: OutputFormat,
) -> RtResult<()> {
    match action {
        ConfigAction::Show => show(config, format),
        ConfigAction::Init { force } => init(config_path, force),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

fn show(cfg: &AppConfig, format: OutputFormat) -> RtResult<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(cfg)?);
        return Ok(());
    }

    println!("{}", style("Engine").bold().underlined());
    println!("  engine.push_enabled        {}", cfg.engine.push_enabled);
    println!("  engine.fallback_enabled    {}", cfg.engine.fallback_enabled);
    println!("  engine.connect_timeout_ms  {}", cfg.engine.connect_timeout_ms);
    println!("  engine.typing_expiry_ms    {}", cfg.engine.typing_expiry_ms);
    println!("  engine.dedupe_messages     {}", cfg.engine.dedupe_messages);
    println!("  engine.dedupe_history      {}", cfg.engine.dedupe_history);
    println!("  engine.event_capacity      {}", cfg.engine.event_capacity);

    println!();
    println!("{}", style("Polling").bold().underlined());
    println!("  polling.interval_ms        {}", cfg.polling.interval_ms);

    println!();
    println!("{}", style("Logging").bold().underlined());
    println!("  logging.level              {}", cfg.logging.level);
    println!("  logging.json_output        {}", cfg.logging.json_output);
    println!("  logging.file               {}", cfg.logging.file);
    let directory = match cfg.logging.file_dir()? {
        Some(dir) => dir.display().to_string(),
        None => style("(console only)").dim().to_string(),
    };
    println!("  logging.directory          {directory}");
    Ok(())
}

fn init(path: &Path, force: bool) -> RtResult<()> {
    if path.exists() && !force {
        return Err(RtError::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }
    AppConfig::default().save_to_file(path)?;
    println!("{} wrote {}", style("ok").green(), path.display());
    Ok(())
}
