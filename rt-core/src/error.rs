//! Global error types for rtsync.
//!
//! All error categories across the workspace are unified into a single
//! `RtError` enum with conversions from underlying library errors. The
//! synchronization engine itself never surfaces these to callers of its
//! public actions; they travel between transports, config, and the CLI.

use thiserror::Error;

/// Convenience type alias for Results using RtError.
pub type RtResult<T> = Result<T, RtError>;

/// Unified error type covering all error categories in rtsync.
#[derive(Error, Debug)]
pub enum RtError {
    // -- Configuration errors --
    /// Failed to load or parse application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // -- Transport errors --
    /// The push channel rejected or failed an operation.
    #[error("push channel error: {0}")]
    PushChannel(String),

    /// The poller rejected or failed an operation.
    #[error("polling error: {0}")]
    Polling(String),

    /// An operation needed a live transport connection.
    #[error("transport not connected")]
    NotConnected,

    /// A raw transport frame could not be decoded.
    #[error("malformed {event} payload: {reason}")]
    MalformedPayload {
        /// Wire event name.
        event: String,
        /// Decoder error.
        reason: String,
    },

    // -- Simulation errors --
    /// A simulation scenario file is invalid.
    #[error("scenario error: {0}")]
    Scenario(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RtError {
    fn from(e: serde_json::Error) -> Self {
        RtError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RtError {
    fn from(e: toml::de::Error) -> Self {
        RtError::Config(e.to_string())
    }
}

impl RtError {
    /// Whether this error came from a transport rather than local code.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::PushChannel(_) | Self::Polling(_) | Self::NotConnected
        )
    }
}
