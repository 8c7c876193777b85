//! Engine settings resolved from the application config.

use std::time::Duration;

use rt_core::config::AppConfig;
use rt_core::constants;

/// Runtime settings for a `SyncEngine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Attempt the push channel on session start.
    pub push_enabled: bool,
    /// Fall back to polling when push is unavailable.
    pub fallback_enabled: bool,
    /// How long to wait for push before falling back.
    pub connect_timeout: Duration,
    /// Lifetime of a typing entry without a stop event.
    pub typing_expiry: Duration,
    pub polling_interval: Duration,
    /// Drop new-message repeats seen during a transport handoff.
    pub dedupe_messages: bool,
    pub dedupe_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            fallback_enabled: true,
            connect_timeout: Duration::from_millis(constants::DEFAULT_CONNECT_TIMEOUT_MS),
            typing_expiry: Duration::from_millis(constants::DEFAULT_TYPING_EXPIRY_MS),
            polling_interval: Duration::from_millis(constants::DEFAULT_POLLING_INTERVAL_MS),
            dedupe_messages: true,
            dedupe_history: constants::MAX_DELIVERED_MESSAGE_HISTORY,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            push_enabled: config.engine.push_enabled,
            fallback_enabled: config.engine.fallback_enabled,
            connect_timeout: config.engine.connect_timeout(),
            typing_expiry: config.engine.typing_expiry(),
            polling_interval: config.polling.interval(),
            dedupe_messages: config.engine.dedupe_messages,
            dedupe_history: config.engine.dedupe_history,
        }
    }
}
