//! Presence derivation.
//!
//! Push-sourced only. The last known status of a user persists until the
//! next presence event or teardown; there is no expiry.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use rt_transport::{PresenceEvent, PresenceKind};

/// Last known status of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineStatus {
    pub is_online: bool,
    /// Copied from the event as sent.
    pub last_seen: Option<Value>,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: HashMap<String, OnlineStatus>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence event and return the derived status.
    pub fn apply(&mut self, event: &PresenceEvent) -> OnlineStatus {
        let status = OnlineStatus {
            is_online: event.kind == PresenceKind::UserOnline,
            last_seen: event.last_seen().cloned(),
        };
        self.users.insert(event.user_id.clone(), status.clone());
        status
    }

    pub fn get(&self, user_id: &str) -> Option<OnlineStatus> {
        self.users.get(user_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, OnlineStatus> {
        self.users.clone()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
