//! Application configuration management.
//!
//! Handles loading, saving, and validating the rtsync configuration:
//! engine timings and fallback policy, polling cadence, and logging.
//! Configuration is persisted as TOML on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{RtError, RtResult};
use crate::paths;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Synchronization engine settings.
    #[serde(default)]
    pub engine: EngineSection,

    /// Polling fallback settings.
    #[serde(default)]
    pub polling: PollingSection,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine arbitration and derived-state settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Attempt the push channel on session start.
    #[serde(default = "default_true")]
    pub push_enabled: bool,

    /// Fall back to polling when push is unavailable.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    /// How long to wait for the push channel before falling back, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Lifetime of a typing indicator without a stop event, in milliseconds.
    #[serde(default = "default_typing_expiry")]
    pub typing_expiry_ms: u64,

    /// Drop new-message events already delivered by the other transport.
    #[serde(default = "default_true")]
    pub dedupe_messages: bool,

    /// Number of delivered message ids remembered for deduplication.
    #[serde(default = "default_dedupe_history")]
    pub dedupe_history: usize,

    /// Capacity of transport event channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Polling fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSection {
    /// Interval between fetches, in milliseconds.
    #[serde(default = "default_polling_interval")]
    pub interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write a rotated log file.
    #[serde(default)]
    pub file: bool,

    /// Directory for the log file. Empty means the per-user default.
    #[serde(default)]
    pub directory: String,

    /// Write the log file as JSON lines.
    #[serde(default)]
    pub json_output: bool,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    constants::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_typing_expiry() -> u64 {
    constants::DEFAULT_TYPING_EXPIRY_MS
}

fn default_dedupe_history() -> usize {
    constants::MAX_DELIVERED_MESSAGE_HISTORY
}

fn default_event_capacity() -> usize {
    constants::DEFAULT_EVENT_CAPACITY
}

fn default_polling_interval() -> u64 {
    constants::DEFAULT_POLLING_INTERVAL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            push_enabled: true,
            fallback_enabled: true,
            connect_timeout_ms: default_connect_timeout(),
            typing_expiry_ms: default_typing_expiry(),
            dedupe_messages: true,
            dedupe_history: default_dedupe_history(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_ms: default_polling_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
            directory: String::new(),
            json_output: false,
        }
    }
}

impl EngineSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}

impl PollingSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LoggingConfig {
    /// Where the log file goes, or `None` for console-only logging.
    pub fn file_dir(&self) -> RtResult<Option<PathBuf>> {
        if !self.file {
            return Ok(None);
        }
        if self.directory.is_empty() {
            paths::default_log_dir().map(Some)
        } else {
            Ok(Some(PathBuf::from(&self.directory)))
        }
    }
}

impl AppConfig {
    /// Load configuration from the default config file path.
    pub fn load_default() -> RtResult<Self> {
        let path = Self::default_config_path()?;
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> RtResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> RtResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RtError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn default_config_path() -> RtResult<PathBuf> {
        Ok(paths::config_dir()?.join("config.toml"))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> RtResult<()> {
        if self.engine.connect_timeout_ms == 0 {
            return Err(RtError::InvalidConfig(
                "engine.connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.engine.typing_expiry_ms == 0 {
            return Err(RtError::InvalidConfig(
                "engine.typing_expiry_ms must be greater than zero".into(),
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(RtError::InvalidConfig(
                "engine.event_capacity must be greater than zero".into(),
            ));
        }
        if self.engine.dedupe_messages && self.engine.dedupe_history == 0 {
            return Err(RtError::InvalidConfig(
                "engine.dedupe_history must be greater than zero when dedupe_messages is on".into(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(RtError::InvalidConfig(
                "polling.interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
