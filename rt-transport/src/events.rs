//! Transport event types and event dispatcher.
//!
//! Defines the wire payloads both transports deliver and provides a
//! broadcast-based dispatcher transports use to publish them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use rt_core::constants::wire;
use rt_core::error::{RtError, RtResult};

/// Event categories a transport can deliver.
///
/// These map 1:1 to the wire event names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new message was posted (`new_message`).
    NewMessage,
    /// Conversation metadata changed (`conversation_update`).
    ConversationUpdate,
    /// A participant started or stopped typing (`typing`).
    Typing,
    /// A user came online or went offline (`user_status_change`).
    UserStatusChange,
    /// A read receipt (`message_read`).
    MessageRead,
    /// Unknown/unhandled event name.
    Unknown(String),
}

impl EventKind {
    /// Parse a wire event name.
    pub fn from_str(s: &str) -> Self {
        match s {
            wire::NEW_MESSAGE => Self::NewMessage,
            wire::CONVERSATION_UPDATE => Self::ConversationUpdate,
            wire::TYPING => Self::Typing,
            wire::USER_STATUS_CHANGE => Self::UserStatusChange,
            wire::MESSAGE_READ => Self::MessageRead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Convert to the wire event name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::NewMessage => wire::NEW_MESSAGE,
            Self::ConversationUpdate => wire::CONVERSATION_UPDATE,
            Self::Typing => wire::TYPING,
            Self::UserStatusChange => wire::USER_STATUS_CHANGE,
            Self::MessageRead => wire::MESSAGE_READ,
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Whether only the push channel sources this category.
    pub fn is_push_only(&self) -> bool {
        matches!(self, Self::Typing | Self::UserStatusChange | Self::MessageRead)
    }
}

/// Message body inside a new-message event.
///
/// Only `id` is interpreted. It is kept as the raw wire value, and every
/// other field (`created_at` included) is stored as received so the body
/// re-serializes unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagePayload {
    /// The id as text: strings verbatim, anything else in its JSON form.
    pub fn id_text(&self) -> String {
        match &self.id {
            Value::String(id) => id.clone(),
            other => other.to_string(),
        }
    }

    pub fn created_at(&self) -> Option<&Value> {
        self.extra.get("created_at").filter(|v| !v.is_null())
    }
}

/// `new_message` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageEvent {
    pub conversation_id: String,
    pub message: MessagePayload,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewMessageEvent {
    /// Key used to recognize the same message arriving from both transports.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.conversation_id, self.message.id_text())
    }
}

/// `conversation_update` payload. `conversation` holds only the changed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdateEvent {
    pub conversation_id: String,
    pub conversation: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Start/stop discriminator of a typing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypingKind {
    #[serde(rename = "typing_start")]
    Start,
    #[serde(rename = "typing_stop")]
    Stop,
}

/// `typing` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TypingKind,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TypingEvent {
    fn new(conversation_id: impl Into<String>, user_id: impl Into<String>, kind: TypingKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            kind,
            extra: Map::new(),
        }
    }

    pub fn start(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(conversation_id, user_id, TypingKind::Start)
    }

    pub fn stop(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(conversation_id, user_id, TypingKind::Stop)
    }
}

/// Online/offline discriminator of a presence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    UserOnline,
    UserOffline,
}

/// `user_status_change` payload.
///
/// `last_seen` lives in `extra` untouched; servers send RFC 3339 strings
/// with offsets, epoch milliseconds or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceEvent {
    pub fn new(user_id: impl Into<String>, kind: PresenceKind) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            extra: Map::new(),
        }
    }

    pub fn with_last_seen(mut self, last_seen: Value) -> Self {
        self.extra.insert("last_seen".to_string(), last_seen);
        self
    }

    /// The wire `last_seen`, `None` when absent or `null`.
    pub fn last_seen(&self) -> Option<&Value> {
        self.extra.get("last_seen").filter(|v| !v.is_null())
    }
}

/// `message_read` payload, forwarded opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadReceiptEvent(pub Value);

/// Everything a transport publishes to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport's connection went up (`true`) or down (`false`).
    ConnectionChanged(bool),
    NewMessage(NewMessageEvent),
    ConversationUpdate(ConversationUpdateEvent),
    Typing(TypingEvent),
    Presence(PresenceEvent),
    MessageRead(ReadReceiptEvent),
}

impl TransportEvent {
    /// Decode a wire frame into a typed event.
    pub fn decode(event_name: &str, data: Value) -> RtResult<Self> {
        let malformed = |e: serde_json::Error| RtError::MalformedPayload {
            event: event_name.to_string(),
            reason: e.to_string(),
        };

        match EventKind::from_str(event_name) {
            EventKind::NewMessage => serde_json::from_value(data)
                .map(Self::NewMessage)
                .map_err(malformed),
            EventKind::ConversationUpdate => serde_json::from_value(data)
                .map(Self::ConversationUpdate)
                .map_err(malformed),
            EventKind::Typing => serde_json::from_value(data)
                .map(Self::Typing)
                .map_err(malformed),
            EventKind::UserStatusChange => serde_json::from_value(data)
                .map(Self::Presence)
                .map_err(malformed),
            EventKind::MessageRead => Ok(Self::MessageRead(ReadReceiptEvent(data))),
            EventKind::Unknown(name) => Err(RtError::MalformedPayload {
                event: name,
                reason: "unknown event name".into(),
            }),
        }
    }

    /// The category of this event, `None` for connection changes.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::ConnectionChanged(_) => None,
            Self::NewMessage(_) => Some(EventKind::NewMessage),
            Self::ConversationUpdate(_) => Some(EventKind::ConversationUpdate),
            Self::Typing(_) => Some(EventKind::Typing),
            Self::Presence(_) => Some(EventKind::UserStatusChange),
            Self::MessageRead(_) => Some(EventKind::MessageRead),
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConnectionChanged(true) => "connected",
            Self::ConnectionChanged(false) => "disconnected",
            Self::NewMessage(_) => wire::NEW_MESSAGE,
            Self::ConversationUpdate(_) => wire::CONVERSATION_UPDATE,
            Self::Typing(_) => wire::TYPING,
            Self::Presence(_) => wire::USER_STATUS_CHANGE,
            Self::MessageRead(_) => wire::MESSAGE_READ,
        }
    }
}

/// Broadcast-based dispatcher transports publish through.
///
/// Every subscriber receives every event in publish order. Slow
/// subscribers that fall behind receive `RecvError::Lagged`.
#[derive(Clone)]
pub struct TransportDispatcher {
    sender: broadcast::Sender<TransportEvent>,
}

impl TransportDispatcher {
    /// Create a new dispatcher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all active subscribers.
    pub fn dispatch(&self, event: TransportEvent) {
        let label = event.label();
        match self.sender.send(event) {
            Ok(count) => {
                debug!("dispatched {label} to {count} subscriber(s)");
            }
            Err(_) => {
                // No active receivers, normal before the engine starts
                debug!("no subscribers for event {label}");
            }
        }
    }

    /// Decode and publish a raw JSON frame.
    ///
    /// Malformed frames are logged and dropped so one bad payload cannot
    /// take down the stream. Returns whether the frame was dispatched.
    pub fn dispatch_raw(&self, event_name: &str, raw: &str) -> bool {
        let decoded = serde_json::from_str::<Value>(raw)
            .map_err(RtError::from)
            .and_then(|data| TransportEvent::decode(event_name, data));

        match decoded {
            Ok(event) => {
                self.dispatch(event);
                true
            }
            Err(e) => {
                warn!("dropping {event_name} frame: {e}");
                false
            }
        }
    }

    /// Get the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(EventKind::from_str("new_message"), EventKind::NewMessage);
        assert_eq!(EventKind::from_str("typing"), EventKind::Typing);
        assert_eq!(
            EventKind::from_str("user_status_change"),
            EventKind::UserStatusChange
        );
        assert_eq!(
            EventKind::from_str("listing_sold"),
            EventKind::Unknown("listing_sold".into())
        );
        for name in wire::ALL {
            assert_eq!(EventKind::from_str(name).as_str(), *name);
        }
    }

    #[test]
    fn test_push_only_categories() {
        assert!(EventKind::Typing.is_push_only());
        assert!(EventKind::UserStatusChange.is_push_only());
        assert!(!EventKind::NewMessage.is_push_only());
        assert!(!EventKind::ConversationUpdate.is_push_only());
    }

    #[test]
    fn test_new_message_preserves_unknown_fields() {
        let raw = json!({
            "conversation_id": "c1",
            "listing_id": "l7",
            "message": {
                "id": "m1",
                "created_at": "2024-05-01T10:00:00Z",
                "body": "is this still available?",
                "attachments": [{"url": "https://cdn.example/1.jpg"}]
            }
        });
        let event = TransportEvent::decode("new_message", raw.clone()).unwrap();
        let TransportEvent::NewMessage(msg) = event else {
            panic!("expected new message");
        };
        assert_eq!(msg.message.id_text(), "m1");
        assert_eq!(msg.dedup_key(), "c1:m1");
        assert_eq!(
            msg.message.created_at(),
            Some(&json!("2024-05-01T10:00:00Z"))
        );
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn test_new_message_numeric_id_and_null_created_at() {
        let raw = json!({
            "conversation_id": "c1",
            "message": {"id": 42, "created_at": null, "body": "hi"}
        });
        let event = TransportEvent::decode("new_message", raw.clone()).unwrap();
        let TransportEvent::NewMessage(msg) = event else {
            panic!("expected new message");
        };
        assert_eq!(msg.dedup_key(), "c1:42");
        assert!(msg.message.created_at().is_none());
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn test_typing_wire_shape() {
        let event: TypingEvent = serde_json::from_value(json!({
            "conversation_id": "c1",
            "user_id": "u1",
            "type": "typing_stop"
        }))
        .unwrap();
        assert_eq!(event, TypingEvent::stop("c1", "u1"));
        assert_eq!(
            serde_json::to_value(TypingEvent::start("c1", "u1")).unwrap(),
            json!({"conversation_id": "c1", "user_id": "u1", "type": "typing_start"})
        );
    }

    #[test]
    fn test_presence_last_seen_optional() {
        let online: PresenceEvent =
            serde_json::from_value(json!({"user_id": "u1", "type": "user_online"})).unwrap();
        assert_eq!(online, PresenceEvent::new("u1", PresenceKind::UserOnline));
        assert!(online.last_seen().is_none());
        assert!(serde_json::to_value(&online).unwrap().get("last_seen").is_none());
    }

    #[test]
    fn test_presence_last_seen_kept_verbatim() {
        let shapes = [
            json!("2024-05-01T12:00:00.000+02:00"),
            json!(1714557600000_i64),
            Value::Null,
        ];
        for last_seen in shapes {
            let raw = json!({
                "user_id": "u1",
                "type": "user_offline",
                "last_seen": last_seen.clone()
            });
            let event = TransportEvent::decode("user_status_change", raw.clone()).unwrap();
            let TransportEvent::Presence(presence) = event else {
                panic!("expected presence");
            };
            assert_eq!(presence.kind, PresenceKind::UserOffline);
            assert_eq!(serde_json::to_value(&presence).unwrap(), raw);
            if last_seen.is_null() {
                assert!(presence.last_seen().is_none());
            } else {
                assert_eq!(presence.last_seen(), Some(&last_seen));
            }
        }
    }

    #[test]
    fn test_conversation_update_round_trip() {
        let raw = json!({
            "conversation_id": "c1",
            "conversation": {"status": "archived", "unread": 0},
            "sequence": 9
        });
        let event = TransportEvent::decode("conversation_update", raw.clone()).unwrap();
        let TransportEvent::ConversationUpdate(update) = event else {
            panic!("expected conversation update");
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), raw);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let err = TransportEvent::decode("typing", json!({"conversation_id": "c1"})).unwrap_err();
        assert!(matches!(err, RtError::MalformedPayload { .. }));

        let err = TransportEvent::decode("bogus", json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown event name"));
    }

    #[test]
    fn test_read_receipt_is_opaque() {
        let raw = json!({"conversation_id": "c1", "reader": "u2", "up_to": "m9"});
        let event = TransportEvent::decode("message_read", raw.clone()).unwrap();
        assert_eq!(event, TransportEvent::MessageRead(ReadReceiptEvent(raw)));
    }

    #[tokio::test]
    async fn test_dispatch_raw_drops_bad_frames() {
        let dispatcher = TransportDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        assert!(!dispatcher.dispatch_raw("typing", "not json"));
        assert!(!dispatcher.dispatch_raw("typing", r#"{"user_id":"u1"}"#));
        assert!(dispatcher.dispatch_raw(
            "typing",
            r#"{"conversation_id":"c1","user_id":"u1","type":"typing_start"}"#
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, TransportEvent::Typing(TypingEvent::start("c1", "u1")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_without_subscribers() {
        let dispatcher = TransportDispatcher::new(4);
        dispatcher.dispatch(TransportEvent::ConnectionChanged(true));
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
