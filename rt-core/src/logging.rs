//! Structured logging on the `tracing` ecosystem.
//!
//! Console output always goes to stderr so command output on stdout stays
//! machine-readable. An optional log directory adds a daily-rotated file in
//! plain or JSON format. `RUST_LOG` takes precedence over the configured
//! level when set.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{RtError, RtResult};

/// Keeps the non-blocking file writer alive; drop it to flush.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// * `level` - filter directive, e.g. "info" or "rt_engine=debug"
/// * `log_dir` - when set, also write `rtsync.log` there, rotated daily
/// * `json_file` - JSON lines instead of plain text in the file
pub fn init_logging(level: &str, log_dir: Option<&Path>, json_file: bool) -> RtResult<LogGuard> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let mut file_guard = None;
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, "rtsync.log"));
            file_guard = Some(guard);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);
            Some(if json_file { layer.json().boxed() } else { layer.boxed() })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| RtError::Internal(format!("logging already initialized: {e}")))?;

    match log_dir {
        Some(dir) => tracing::debug!("logging at {level}, file in {}", dir.display()),
        None => tracing::debug!("logging at {level}, console only"),
    }
    Ok(LogGuard { _file: file_guard })
}

/// Install logging from the `[logging]` section. `level_override` wins over
/// the configured level (used for `--verbose`).
pub fn init_from_config(config: &LoggingConfig, level_override: Option<&str>) -> RtResult<LogGuard> {
    let level = level_override.unwrap_or(&config.level);
    let log_dir = config.file_dir()?;
    init_logging(level, log_dir.as_deref(), config.json_output)
}
