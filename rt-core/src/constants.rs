//! Application-wide constants.

/// Application name.
pub const APP_NAME: &str = "rtsync";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the engine waits for the push channel before falling back to polling.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// How long a typing indicator survives without a matching stop event.
pub const DEFAULT_TYPING_EXPIRY_MS: u64 = 10_000;

/// Default poller fetch interval.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 5_000;

/// Maximum number of delivered message ids remembered for handoff deduplication.
pub const MAX_DELIVERED_MESSAGE_HISTORY: usize = 100;

/// Broadcast channel capacity for transport event streams.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Wire event names shared by both transports.
pub mod wire {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const CONVERSATION_UPDATE: &str = "conversation_update";
    pub const TYPING: &str = "typing";
    pub const USER_STATUS_CHANGE: &str = "user_status_change";
    pub const MESSAGE_READ: &str = "message_read";

    /// All event names a push channel delivers.
    pub const ALL: &[&str] = &[
        NEW_MESSAGE,
        CONVERSATION_UPDATE,
        TYPING,
        USER_STATUS_CHANGE,
        MESSAGE_READ,
    ];
}
