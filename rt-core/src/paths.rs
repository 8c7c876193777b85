//! Per-user directories.
//!
//! `RTSYNC_HOME` relocates everything under one root, which keeps test runs
//! and side-by-side installs away from the user's real files.

use std::path::PathBuf;

use crate::constants::APP_NAME;
use crate::error::{RtError, RtResult};

/// Environment variable that overrides every rtsync directory.
pub const HOME_ENV: &str = "RTSYNC_HOME";

fn home_override() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Directory holding `config.toml`.
///
/// `$RTSYNC_HOME`, otherwise the platform config dir (`~/.config/rtsync`,
/// `~/Library/Application Support/rtsync`, `%APPDATA%\rtsync`).
pub fn config_dir() -> RtResult<PathBuf> {
    if let Some(home) = home_override() {
        return Ok(home);
    }
    dirs::config_dir()
        .map(|base| base.join(APP_NAME))
        .ok_or_else(|| RtError::Config("could not determine config directory".into()))
}

/// Directory for rotated log files when no explicit one is configured.
pub fn default_log_dir() -> RtResult<PathBuf> {
    if let Some(home) = home_override() {
        return Ok(home.join("logs"));
    }
    dirs::data_local_dir()
        .map(|base| base.join(APP_NAME).join("logs"))
        .ok_or_else(|| RtError::Config("could not determine data directory".into()))
}
