//! Connection status published to consumers.

use serde::Serialize;

/// Which transport is currently authoritative.
///
/// Derived from the arbitration phase: at most one flag is set at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub push_channel_up: bool,
    pub polling_up: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.push_channel_up || self.polling_up
    }

    /// Tri-state indicator a UI renders in place of error dialogs.
    pub fn indicator(&self) -> ConnectionIndicator {
        if self.push_channel_up {
            ConnectionIndicator::Live
        } else if self.polling_up {
            ConnectionIndicator::Sync
        } else {
            ConnectionIndicator::Offline
        }
    }
}

/// Passive connection indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionIndicator {
    /// Push channel active.
    Live,
    /// Polling fallback active.
    Sync,
    /// Neither transport active.
    Offline,
}

impl std::fmt::Display for ConnectionIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Sync => write!(f, "sync"),
            Self::Offline => write!(f, "offline"),
        }
    }
}
