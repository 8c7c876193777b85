//! rtsync Transport - event payloads and transport contracts.
//!
//! This crate defines everything the synchronization engine needs from its
//! two transports:
//! - Wire payload types for the five event categories
//! - A broadcast-based dispatcher transports use to publish events
//! - The `PushChannel` and `PollingClient` traits
//! - In-memory transports for tests and the scenario simulator

pub mod contract;
pub mod events;
pub mod memory;

// Re-export key types
pub use contract::{PollingClient, PollingConfig, PushChannel};
pub use events::{
    ConversationUpdateEvent, EventKind, MessagePayload, NewMessageEvent, PresenceEvent,
    PresenceKind, ReadReceiptEvent, TransportDispatcher, TransportEvent, TypingEvent, TypingKind,
};
pub use memory::{MemoryPoller, MemoryPushChannel, PushCall};
