//! Shared test utilities for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rt_engine::{Clock, EngineConfig, SyncEngine};
use rt_transport::{
    MemoryPoller, MemoryPushChannel, NewMessageEvent, PresenceEvent, PresenceKind, PushCall,
    TransportEvent, TypingEvent,
};

/// An engine wired to in-memory transports the test can drive.
pub struct Harness {
    pub push: Arc<MemoryPushChannel>,
    pub poller: Arc<MemoryPoller>,
    pub engine: SyncEngine,
}

/// Engine with default config; push connects only when the test says so.
pub fn create_harness() -> Harness {
    create_harness_with(MemoryPushChannel::new(64), EngineConfig::default())
}

pub fn create_harness_with(push: MemoryPushChannel, config: EngineConfig) -> Harness {
    let push = Arc::new(push);
    let poller = Arc::new(MemoryPoller::new(64));
    let engine = SyncEngine::new(push.clone(), poller.clone(), config);
    Harness { push, poller, engine }
}

/// Engine with default config whose typing timestamps come from `clock`.
pub fn create_harness_with_clock(clock: Arc<dyn Clock>) -> Harness {
    let push = Arc::new(MemoryPushChannel::new(64));
    let poller = Arc::new(MemoryPoller::new(64));
    let engine = SyncEngine::with_clock(push.clone(), poller.clone(), EngineConfig::default(), clock);
    Harness { push, poller, engine }
}

/// Start a session and bring push up.
pub async fn create_live_harness() -> Harness {
    let h = create_harness();
    h.engine.start("alice");
    settle().await;
    h.push.set_link(true);
    settle().await;
    h
}

/// Let the driver and pump tasks drain.
///
/// Advances a paused clock by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Collects every value passed to a callback.
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |value: &T| seen.lock().unwrap().push(value.clone())
    }

    pub fn all(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<T> {
        self.seen.lock().unwrap().last().cloned()
    }
}

pub fn new_message(conversation_id: &str, message_id: &str) -> TransportEvent {
    TransportEvent::NewMessage(
        serde_json::from_value::<NewMessageEvent>(serde_json::json!({
            "conversation_id": conversation_id,
            "message": {
                "id": message_id,
                "created_at": "2024-07-01T10:30:00Z",
                "text": "hello"
            }
        }))
        .expect("valid new_message payload"),
    )
}

pub fn typing_start(conversation_id: &str, user_id: &str) -> TransportEvent {
    TransportEvent::Typing(TypingEvent::start(conversation_id, user_id))
}

pub fn typing_stop(conversation_id: &str, user_id: &str) -> TransportEvent {
    TransportEvent::Typing(TypingEvent::stop(conversation_id, user_id))
}

pub fn presence(user_id: &str, kind: PresenceKind) -> TransportEvent {
    TransportEvent::Presence(PresenceEvent::new(user_id, kind))
}

/// Number of push join calls made for `conversation_id`.
pub fn join_count(push: &MemoryPushChannel, conversation_id: &str) -> usize {
    push.calls()
        .iter()
        .filter(|call| matches!(call, PushCall::Join(id) if id == conversation_id))
        .count()
}

pub fn disconnect_count(push: &MemoryPushChannel) -> usize {
    push.calls()
        .iter()
        .filter(|call| matches!(call, PushCall::Disconnect))
        .count()
}
