//! Derived state and delivery integration tests.
//!
//! Typing status with expiry, presence, read receipts, handoff
//! de-duplication, malformed frames, and subscriber isolation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::sleep;

use common::{
    create_harness_with, create_harness_with_clock, create_live_harness, new_message, presence,
    settle, typing_start, typing_stop, Harness, Recorder,
};
use rt_engine::{EngineConfig, PresenceUpdate, Subscription, TokioClock, TypingEntry, TypingUpdate};
use rt_transport::{
    MemoryPushChannel, NewMessageEvent, PresenceEvent, PresenceKind, ReadReceiptEvent,
    TransportEvent, TypingKind,
};

async fn polling_harness_with(config: EngineConfig) -> Harness {
    let h = create_harness_with(MemoryPushChannel::new(64), config);
    h.engine.start("alice");
    settle().await;
    sleep(Duration::from_secs(5)).await;
    h
}

// ---- Typing ----

#[tokio::test(start_paused = true)]
async fn typing_start_then_stop_removes_entry() {
    let h = create_live_harness().await;
    let updates = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(updates.callback());

    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    let status = h.engine.typing_status().await;
    let entry = status["c1"]["bob"];
    assert!(entry.is_typing);
    assert!(entry.timestamp > 0);
    assert_eq!(h.engine.pending_timer_count().await, 1);

    sleep(Duration::from_secs(5)).await;
    h.push.emit(typing_stop("c1", "bob"));
    settle().await;
    assert!(h.engine.typing_status().await.is_empty());
    assert_eq!(h.engine.pending_timer_count().await, 0);

    let all = updates.all();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].event.kind, TypingKind::Stop);
    assert!(!all[1].expired);
}

#[tokio::test(start_paused = true)]
async fn typing_timestamp_comes_from_engine_clock() {
    let h = create_harness_with_clock(Arc::new(TokioClock::starting_at(0)));
    h.engine.start("alice");
    // Each settle() moves the paused clock forward by 1ms.
    settle().await;
    h.push.set_link(true);
    h.push.emit(typing_start("c1", "bob"));
    settle().await;

    let status = h.engine.typing_status().await;
    assert_eq!(
        status["c1"]["bob"],
        TypingEntry {
            is_typing: true,
            timestamp: 1
        }
    );

    sleep(Duration::from_secs(4)).await;
    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    assert_eq!(h.engine.typing_status().await["c1"]["bob"].timestamp, 4_002);
}

#[tokio::test(start_paused = true)]
async fn typing_entry_expires_after_ten_seconds() {
    let h = create_live_harness().await;
    let updates = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(updates.callback());

    h.push.emit(typing_start("c1", "bob"));
    settle().await;

    sleep(Duration::from_millis(9_900)).await;
    assert_eq!(h.engine.typing_users("c1").await, vec!["bob"]);

    sleep(Duration::from_millis(200)).await;
    assert!(h.engine.typing_users("c1").await.is_empty());
    assert_eq!(h.engine.pending_timer_count().await, 0);

    let expired = updates.last().unwrap();
    assert!(expired.expired);
    assert_eq!(expired.event.kind, TypingKind::Stop);
    assert_eq!(expired.event.user_id, "bob");
    assert!(expired.typing.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_after_expiry_is_noop() {
    let h = create_live_harness().await;
    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    sleep(Duration::from_secs(11)).await;

    h.push.emit(typing_stop("c1", "bob"));
    settle().await;
    assert!(h.engine.typing_status().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_start_replaces_timer() {
    let h = create_live_harness().await;
    h.push.emit(typing_start("c1", "bob"));
    settle().await;

    sleep(Duration::from_secs(6)).await;
    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    assert_eq!(h.engine.pending_timer_count().await, 1);

    // Past the first deadline, before the second.
    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.engine.typing_users("c1").await, vec!["bob"]);

    sleep(Duration::from_secs(5)).await;
    assert!(h.engine.typing_users("c1").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn typing_pairs_expire_independently() {
    let h = create_live_harness().await;
    h.push.emit(typing_start("c1", "bob"));
    h.push.emit(typing_start("c2", "bob"));
    settle().await;
    sleep(Duration::from_secs(4)).await;
    h.push.emit(typing_start("c1", "carol"));
    settle().await;

    sleep(Duration::from_secs(7)).await;
    assert_eq!(h.engine.typing_users("c1").await, vec!["carol"]);
    assert!(h.engine.typing_users("c2").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn typing_state_is_updated_before_callbacks() {
    let h = create_live_harness().await;
    let updates = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(updates.callback());

    h.push.emit(typing_start("c1", "bob"));
    h.push.emit(typing_start("c1", "carol"));
    h.push.emit(typing_stop("c1", "bob"));
    settle().await;

    let all = updates.all();
    assert_eq!(all.len(), 3);
    assert!(all[0].typing.contains_key("bob"));
    assert_eq!(all[1].typing.len(), 2);
    assert!(!all[2].typing.contains_key("bob"));
    assert!(all[2].typing.contains_key("carol"));
}

#[tokio::test(start_paused = true)]
async fn typing_from_poller_is_ignored() {
    let h = polling_harness_with(EngineConfig::default()).await;
    let updates = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(updates.callback());

    h.poller.emit(typing_start("c1", "bob"));
    settle().await;
    assert_eq!(updates.len(), 0);
    assert!(h.engine.typing_status().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn custom_typing_expiry() {
    let config = EngineConfig {
        typing_expiry: Duration::from_secs(3),
        ..EngineConfig::default()
    };
    let h = create_harness_with(MemoryPushChannel::new(64).with_auto_connect(), config);
    h.engine.start("alice");
    settle().await;

    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    sleep(Duration::from_millis(2_900)).await;
    assert_eq!(h.engine.typing_users("c1").await, vec!["bob"]);
    sleep(Duration::from_millis(200)).await;
    assert!(h.engine.typing_users("c1").await.is_empty());
}

// ---- Presence ----

#[tokio::test(start_paused = true)]
async fn presence_tracks_last_known_status() {
    let h = create_live_harness().await;
    let updates = Recorder::<PresenceUpdate>::new();
    h.engine.on_presence(updates.callback());

    h.push.emit(presence("bob", PresenceKind::UserOnline));
    settle().await;
    assert!(h.engine.user_status("bob").await.unwrap().is_online);

    let frame = r#"{"user_id":"bob","type":"user_offline","last_seen":"2024-07-01T12:30:00.000+02:00"}"#;
    assert!(h.push.emit_raw("user_status_change", frame));
    settle().await;

    let status = h.engine.user_status("bob").await.unwrap();
    assert!(!status.is_online);
    assert_eq!(
        status.last_seen,
        Some(serde_json::json!("2024-07-01T12:30:00.000+02:00"))
    );
    let delivered = serde_json::to_value(&updates.last().unwrap().event).unwrap();
    assert_eq!(delivered, serde_json::from_str::<serde_json::Value>(frame).unwrap());
    assert_eq!(updates.len(), 2);
    assert_eq!(updates.last().unwrap().status, status);
    assert!(h.engine.user_status("nobody").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn presence_persists_without_expiry() {
    let h = create_live_harness().await;
    h.push.emit(presence("bob", PresenceKind::UserOnline));
    settle().await;
    sleep(Duration::from_secs(3_600)).await;
    assert!(h.engine.user_status("bob").await.unwrap().is_online);
    assert_eq!(h.engine.online_statuses().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn presence_frozen_while_polling() {
    let h = create_live_harness().await;
    h.push.emit(presence("bob", PresenceKind::UserOnline));
    settle().await;

    h.push.set_link(false);
    settle().await;
    h.poller.emit(TransportEvent::Presence(PresenceEvent::new(
        "bob",
        PresenceKind::UserOffline,
    )));
    settle().await;

    assert!(h.engine.user_status("bob").await.unwrap().is_online);
}

// ---- Messages, updates, read receipts ----

#[tokio::test(start_paused = true)]
async fn payloads_reach_subscribers_unchanged() {
    let h = create_live_harness().await;
    let messages = Recorder::<NewMessageEvent>::new();
    let receipts = Recorder::<ReadReceiptEvent>::new();
    let updates = Recorder::<rt_transport::ConversationUpdateEvent>::new();
    h.engine.on_new_message(messages.callback());
    h.engine.on_read_receipt(receipts.callback());
    h.engine.on_conversation_update(updates.callback());

    let message = r#"{"conversation_id":"c1","message":{"id":"m1","created_at":"2024-07-01T10:30:00Z","text":"hi","attachments":[]}}"#;
    assert!(h.push.emit_raw("new_message", message));
    assert!(h
        .push
        .emit_raw("conversation_update", r#"{"conversation_id":"c1","conversation":{"title":"Team"}}"#));
    assert!(h
        .push
        .emit_raw("message_read", r#"{"conversation_id":"c1","reader":"bob","up_to":"m1"}"#));
    settle().await;

    let delivered = messages.last().unwrap();
    assert_eq!(
        serde_json::to_value(&delivered).unwrap(),
        serde_json::from_str::<serde_json::Value>(message).unwrap()
    );
    assert_eq!(updates.last().unwrap().conversation["title"], "Team");
    assert_eq!(receipts.last().unwrap().0["reader"], "bob");
}

#[tokio::test(start_paused = true)]
async fn poller_serves_messages_while_fallback_active() {
    let h = polling_harness_with(EngineConfig::default()).await;
    let messages = Recorder::<NewMessageEvent>::new();
    h.engine.on_new_message(messages.callback());

    h.poller.enqueue(new_message("c1", "m1"));
    h.poller.enqueue(new_message("c1", "m2"));
    sleep(Duration::from_secs(5)).await;

    let ids: Vec<String> = messages.all().into_iter().map(|m| m.message.id_text()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn read_receipts_from_poller_are_dropped() {
    let h = polling_harness_with(EngineConfig::default()).await;
    let receipts = Recorder::<ReadReceiptEvent>::new();
    h.engine.on_read_receipt(receipts.callback());

    h.poller
        .emit(TransportEvent::MessageRead(ReadReceiptEvent(serde_json::json!({"reader": "bob"}))));
    settle().await;
    assert_eq!(receipts.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_frame_is_dropped_and_delivery_continues() {
    let h = create_live_harness().await;
    let updates = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(updates.callback());

    assert!(!h.push.emit_raw("typing", r#"{"conversation_id": 5}"#));
    assert!(!h.push.emit_raw("typing", "not json"));
    assert!(!h.push.emit_raw("mystery_event", "{}"));
    h.push.emit(typing_start("c1", "bob"));
    settle().await;

    assert_eq!(updates.len(), 1);
    assert_eq!(h.engine.typing_users("c1").await, vec!["bob"]);
}

// ---- Handoff de-duplication ----

#[tokio::test(start_paused = true)]
async fn handoff_duplicate_is_delivered_once() {
    let h = polling_harness_with(EngineConfig::default()).await;
    let messages = Recorder::<NewMessageEvent>::new();
    h.engine.on_new_message(messages.callback());

    h.poller.emit(new_message("c1", "m1"));
    settle().await;
    h.push.set_link(true);
    h.push.emit(new_message("c1", "m1"));
    h.push.emit(new_message("c1", "m2"));
    settle().await;

    let ids: Vec<String> = messages.all().into_iter().map(|m| m.message.id_text()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn dedupe_can_be_disabled() {
    let config = EngineConfig {
        dedupe_messages: false,
        ..EngineConfig::default()
    };
    let h = polling_harness_with(config).await;
    let messages = Recorder::<NewMessageEvent>::new();
    h.engine.on_new_message(messages.callback());

    h.poller.emit(new_message("c1", "m1"));
    settle().await;
    h.push.set_link(true);
    h.push.emit(new_message("c1", "m1"));
    settle().await;

    assert_eq!(messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dedupe_history_resets_on_teardown() {
    let h = create_live_harness().await;
    let messages = Recorder::<NewMessageEvent>::new();
    h.engine.on_new_message(messages.callback());

    h.push.emit(new_message("c1", "m1"));
    settle().await;
    h.engine.disconnect();
    h.engine.start("alice");
    settle().await;
    h.push.set_link(true);
    h.push.emit(new_message("c1", "m1"));
    settle().await;

    assert_eq!(messages.len(), 2);
}

// ---- Subscriptions ----

#[tokio::test(start_paused = true)]
async fn unsubscribe_twice_is_noop() {
    let h = create_live_harness().await;
    let first = Recorder::<NewMessageEvent>::new();
    let second = Recorder::<NewMessageEvent>::new();
    let sub = h.engine.on_new_message(first.callback());
    h.engine.on_new_message(second.callback());

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());

    h.push.emit(new_message("c1", "m1"));
    settle().await;
    assert_eq!(first.len(), 0);
    assert_eq!(second.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscriber_can_unsubscribe_itself_during_delivery() {
    let h = create_live_harness().await;
    let slot: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let sub = {
        let slot = Arc::clone(&slot);
        let calls = Arc::clone(&calls);
        h.engine.on_typing(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = slot.get() {
                me.unsubscribe();
            }
        })
    };
    slot.set(sub).unwrap();
    let others = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(others.callback());

    h.push.emit(typing_start("c1", "bob"));
    h.push.emit(typing_stop("c1", "bob"));
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(others.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_subscriber_does_not_block_others() {
    let h = create_live_harness().await;
    h.engine.on_new_message(|_| panic!("broken consumer"));
    let healthy = Recorder::<NewMessageEvent>::new();
    h.engine.on_new_message(healthy.callback());

    h.push.emit(new_message("c1", "m1"));
    h.push.emit(new_message("c1", "m2"));
    settle().await;

    assert_eq!(healthy.len(), 2);
    assert_eq!(h.engine.phase().await, rt_engine::ConnectionPhase::PushActive);
}

#[tokio::test(start_paused = true)]
async fn panicking_subscriber_on_expiry_is_isolated() {
    let h = create_live_harness().await;
    h.engine.on_typing(|update| {
        if update.expired {
            panic!("broken consumer");
        }
    });
    let healthy = Recorder::<TypingUpdate>::new();
    h.engine.on_typing(healthy.callback());

    h.push.emit(typing_start("c1", "bob"));
    settle().await;
    sleep(Duration::from_secs(11)).await;

    assert_eq!(healthy.len(), 2);
    assert!(healthy.last().unwrap().expired);
}

#[tokio::test(start_paused = true)]
async fn callbacks_may_call_engine_actions() {
    let h = create_live_harness().await;
    let engine = h.engine.clone();
    h.engine.on_new_message(move |event| {
        engine.start_tracking([event.conversation_id.clone()]);
    });

    h.push.emit(new_message("c7", "m1"));
    settle().await;
    settle().await;

    assert_eq!(h.engine.tracked_conversations().await, vec!["c7"]);
    assert_eq!(h.push.joined_rooms(), vec!["c7"]);
}
