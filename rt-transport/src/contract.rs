//! Contracts the synchronization engine expects from its transports.
//!
//! Both transports publish through a `TransportDispatcher`, so the engine
//! consumes them through the same `subscribe()` surface regardless of
//! which one is active. Connect/fetch completion is reported through
//! events, never by blocking the caller.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use rt_core::constants;
use rt_core::error::RtResult;

use crate::events::TransportEvent;

/// Persistent, server-initiated event channel (e.g. a long-lived socket).
///
/// Implementations retry their own connection failures and report the
/// outcome as `TransportEvent::ConnectionChanged`.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Begin connecting for `user_id`. Returns once the attempt is under way.
    async fn connect(&self, user_id: &str) -> RtResult<()>;

    /// Close the connection and stop reconnecting.
    async fn disconnect(&self);

    /// Connection changes and all five event categories.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> RtResult<()>;

    async fn join_conversation(&self, conversation_id: &str) -> RtResult<()>;

    async fn leave_conversation(&self, conversation_id: &str) -> RtResult<()>;

    /// Point-in-time connection check.
    fn is_connected(&self) -> bool;
}

/// Poller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_millis(constants::DEFAULT_POLLING_INTERVAL_MS),
        }
    }
}

/// Request/response fallback that fetches events on an interval.
///
/// Only sources new-message and conversation-update events.
#[async_trait]
pub trait PollingClient: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn configure(&self, config: PollingConfig);

    /// Start fetching. Has no effect unless the poller is enabled.
    async fn start(&self) -> RtResult<()>;

    async fn stop(&self);

    fn is_enabled(&self) -> bool;

    fn track_conversation(&self, conversation_id: &str);

    fn untrack_conversation(&self, conversation_id: &str);

    fn tracked_conversations(&self) -> Vec<String>;
}
