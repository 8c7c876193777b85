//! The synchronization engine.
//!
//! A `SyncEngine` is a cheap, cloneable handle. All state is owned by a
//! single driver task that processes commands in order: consumer actions,
//! transport events forwarded by one pump task per transport, and timer
//! firings. Consumer callbacks run on the driver task after derived state
//! has been updated, and may call back into the engine freely since every
//! action is a non-blocking command send.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rt_core::error::RtError;
use rt_transport::{
    ConversationUpdateEvent, NewMessageEvent, PollingClient, PollingConfig, PresenceEvent,
    PushChannel, ReadReceiptEvent, TransportEvent, TypingEvent, TypingKind,
};

use crate::arbitration::{transition, ConnectionPhase, Effect, Input, Transition};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dedup::DeliveredMessages;
use crate::presence::{OnlineStatus, PresenceTracker};
use crate::status::ConnectionStatus;
use crate::subscription::{CallbackRegistry, Subscription};
use crate::tracking::TrackedConversations;
use crate::typing::{TypingEntry, TypingStatus, TypingTracker};

/// Delivered to typing subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypingUpdate {
    /// The raw event, or a synthesized `typing_stop` when an entry expired.
    pub event: TypingEvent,
    /// Typing entries of the event's conversation after the event was applied.
    pub typing: HashMap<String, TypingEntry>,
    /// Whether the entry was removed by the expiry timer.
    pub expired: bool,
}

/// Delivered to presence subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceUpdate {
    pub event: PresenceEvent,
    pub status: OnlineStatus,
}

/// Point-in-time copy of the engine's state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub phase: ConnectionPhase,
    pub status: ConnectionStatus,
    pub session_user: Option<String>,
    pub tracked: Vec<String>,
    pub typing: TypingStatus,
    pub presence: HashMap<String, OnlineStatus>,
    pub pending_timers: usize,
}

/// Which transport an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Push,
    Poller,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Poller => write!(f, "poller"),
        }
    }
}

enum Command {
    Start {
        user_id: String,
    },
    SendTyping {
        conversation_id: String,
        is_typing: bool,
    },
    StartTracking(Vec<String>),
    StopTracking,
    Reconnect,
    Disconnect,
    ConnectTimeout {
        generation: u64,
    },
    TypingExpired {
        conversation_id: String,
        user_id: String,
        generation: u64,
    },
    Transport {
        source: Source,
        epoch: u64,
        event: TransportEvent,
    },
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

struct Subscribers {
    new_message: CallbackRegistry<NewMessageEvent>,
    conversation_update: CallbackRegistry<ConversationUpdateEvent>,
    typing: CallbackRegistry<TypingUpdate>,
    presence: CallbackRegistry<PresenceUpdate>,
    read_receipt: CallbackRegistry<ReadReceiptEvent>,
}

impl Subscribers {
    fn new() -> Self {
        Self {
            new_message: CallbackRegistry::new("new_message"),
            conversation_update: CallbackRegistry::new("conversation_update"),
            typing: CallbackRegistry::new("typing"),
            presence: CallbackRegistry::new("presence"),
            read_receipt: CallbackRegistry::new("read_receipt"),
        }
    }
}

/// Handle to a running synchronization engine.
///
/// Dropping every handle stops the driver, which tears the session down.
#[derive(Clone)]
pub struct SyncEngine {
    commands: UnboundedSender<Command>,
    subscribers: Arc<Subscribers>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SyncEngine {
    /// Create an engine over the given transports and spawn its driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        push: Arc<dyn PushChannel>,
        poller: Arc<dyn PollingClient>,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(push, poller, config, Arc::new(SystemClock))
    }

    /// Like `new`, with typing timestamps taken from `clock`.
    pub fn with_clock(
        push: Arc<dyn PushChannel>,
        poller: Arc<dyn PollingClient>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let subscribers = Arc::new(Subscribers::new());

        let driver = EngineDriver {
            delivered: DeliveredMessages::new(config.dedupe_messages, config.dedupe_history),
            config,
            clock,
            push,
            poller,
            subscribers: Arc::clone(&subscribers),
            commands: commands.downgrade(),
            status_tx,
            phase: ConnectionPhase::Idle,
            session: None,
            epoch: 0,
            pumps: Vec::new(),
            connect_timer: None,
            timer_generation: 0,
            typing: TypingTracker::new(),
            presence: PresenceTracker::new(),
            tracked: TrackedConversations::new(),
            push_rooms: HashSet::new(),
        };
        tokio::spawn(driver.run(receiver));

        Self {
            commands,
            subscribers,
            status,
        }
    }

    /// Start a session for `user_id`. Ignored while a session is active.
    pub fn start(&self, user_id: impl Into<String>) {
        self.send(Command::Start {
            user_id: user_id.into(),
        });
    }

    pub fn on_new_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NewMessageEvent) + Send + Sync + 'static,
    {
        self.subscribers.new_message.register(callback)
    }

    pub fn on_conversation_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConversationUpdateEvent) + Send + Sync + 'static,
    {
        self.subscribers.conversation_update.register(callback)
    }

    /// Typing subscribers also receive a synthesized stop when an entry expires.
    pub fn on_typing<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TypingUpdate) + Send + Sync + 'static,
    {
        self.subscribers.typing.register(callback)
    }

    pub fn on_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceUpdate) + Send + Sync + 'static,
    {
        self.subscribers.presence.register(callback)
    }

    pub fn on_read_receipt<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ReadReceiptEvent) + Send + Sync + 'static,
    {
        self.subscribers.read_receipt.register(callback)
    }

    /// Signal typing on the push channel. Dropped unless push is active.
    pub fn send_typing(&self, conversation_id: impl Into<String>, is_typing: bool) {
        self.send(Command::SendTyping {
            conversation_id: conversation_id.into(),
            is_typing,
        });
    }

    /// Track conversations on both transports. Already tracked ids are skipped.
    pub fn start_tracking<I, S>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = conversation_ids.into_iter().map(Into::into).collect();
        self.send(Command::StartTracking(ids));
    }

    /// Leave every tracked conversation.
    pub fn stop_tracking(&self) {
        self.send(Command::StopTracking);
    }

    /// Force a fresh push connection attempt. An active poller keeps running
    /// until push confirms.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Tear the session down. Safe to call repeatedly and from any state.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Latest published connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Snapshot of the engine state after every previously issued command
    /// has been processed.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot(reply));
        response.await.unwrap_or_default()
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.snapshot().await.phase
    }

    pub async fn typing_status(&self) -> TypingStatus {
        self.snapshot().await.typing
    }

    /// Users currently typing in a conversation, sorted.
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing_status()
            .await
            .remove(conversation_id)
            .map(|entries| entries.into_keys().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub async fn user_status(&self, user_id: &str) -> Option<OnlineStatus> {
        self.snapshot().await.presence.remove(user_id)
    }

    pub async fn online_statuses(&self) -> HashMap<String, OnlineStatus> {
        self.snapshot().await.presence
    }

    pub async fn tracked_conversations(&self) -> Vec<String> {
        self.snapshot().await.tracked
    }

    /// Outstanding typing expiry and connect timers.
    pub async fn pending_timer_count(&self) -> usize {
        self.snapshot().await.pending_timers
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("sync engine driver stopped, command dropped");
        }
    }
}

struct Session {
    id: Uuid,
    user_id: String,
    epoch: u64,
}

struct EngineDriver {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    push: Arc<dyn PushChannel>,
    poller: Arc<dyn PollingClient>,
    subscribers: Arc<Subscribers>,
    commands: WeakUnboundedSender<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    phase: ConnectionPhase,
    session: Option<Session>,
    /// Incremented per session; events pumped for an older session are ignored.
    epoch: u64,
    pumps: Vec<JoinHandle<()>>,
    connect_timer: Option<(u64, JoinHandle<()>)>,
    timer_generation: u64,
    typing: TypingTracker,
    presence: PresenceTracker,
    tracked: TrackedConversations,
    /// Rooms joined on the current push connection.
    push_rooms: HashSet<String>,
    delivered: DeliveredMessages,
}

impl EngineDriver {
    async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        self.teardown().await;
        debug!("sync engine driver stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { user_id } => self.start_session(user_id).await,
            Command::SendTyping {
                conversation_id,
                is_typing,
            } => self.send_typing(&conversation_id, is_typing).await,
            Command::StartTracking(ids) => self.start_tracking(ids).await,
            Command::StopTracking => self.stop_tracking().await,
            Command::Reconnect => {
                if self.session.is_none() || !self.config.push_enabled {
                    debug!("reconnect ignored, no push session");
                    return;
                }
                info!("forcing push reconnect");
                self.apply(Input::Reconnect).await;
            }
            Command::Disconnect => self.teardown().await,
            Command::ConnectTimeout { generation } => {
                if !matches!(self.connect_timer, Some((current, _)) if current == generation) {
                    return;
                }
                self.connect_timer = None;
                if self.phase == ConnectionPhase::ConnectingPush {
                    if self.config.fallback_enabled {
                        warn!(
                            "push not connected after {}ms, falling back to polling",
                            self.config.connect_timeout.as_millis()
                        );
                    } else {
                        warn!("push not connected yet and fallback is disabled");
                    }
                }
                self.apply(Input::ConnectTimeout).await;
            }
            Command::TypingExpired {
                conversation_id,
                user_id,
                generation,
            } => self.expire_typing(conversation_id, user_id, generation),
            Command::Transport {
                source,
                epoch,
                event,
            } => {
                if self.session.as_ref().map(|s| s.epoch) != Some(epoch) {
                    debug!("stale {source} {} dropped", event.label());
                    return;
                }
                self.on_transport_event(source, event).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn start_session(&mut self, user_id: String) {
        if let Some(session) = &self.session {
            debug!("session {} already active, start ignored", session.id);
            return;
        }
        if !self.config.push_enabled && !self.config.fallback_enabled {
            warn!("push and polling are both disabled, staying offline");
            return;
        }

        self.epoch += 1;
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            epoch: self.epoch,
        };
        info!("starting sync session {} for {}", session.id, session.user_id);

        // Subscribe before connecting so no connection change is missed.
        if self.config.push_enabled {
            self.pumps.push(spawn_pump(
                Source::Push,
                session.epoch,
                self.push.subscribe(),
                self.commands.clone(),
            ));
        }
        if self.config.fallback_enabled {
            self.pumps.push(spawn_pump(
                Source::Poller,
                session.epoch,
                self.poller.subscribe(),
                self.commands.clone(),
            ));
        }
        self.session = Some(session);

        let pending = self.tracked.to_vec();
        for id in &pending {
            self.mirror_track(id).await;
        }

        self.apply(Input::SessionStart {
            push_enabled: self.config.push_enabled,
        })
        .await;
    }

    async fn apply(&mut self, input: Input) {
        let Transition { next, effects } =
            transition(self.phase, input, self.config.fallback_enabled);
        if next != self.phase {
            info!("connection phase {} -> {} on {input:?}", self.phase, next);
        }
        self.phase = next;
        for effect in effects {
            self.run_effect(effect).await;
        }
        self.publish_status();
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::ConnectPush => self.connect_push().await,
            Effect::RestartPush => {
                self.push.disconnect().await;
                self.push_rooms.clear();
                self.connect_push().await;
            }
            Effect::ArmConnectTimer => {
                self.timer_generation += 1;
                let generation = self.timer_generation;
                let handle = schedule(
                    self.commands.clone(),
                    self.config.connect_timeout,
                    Command::ConnectTimeout { generation },
                );
                if let Some((_, previous)) = self.connect_timer.replace((generation, handle)) {
                    previous.abort();
                }
            }
            Effect::CancelConnectTimer => {
                if let Some((_, handle)) = self.connect_timer.take() {
                    handle.abort();
                }
            }
            Effect::StartPolling => {
                self.poller.configure(PollingConfig {
                    enabled: true,
                    interval: self.config.polling_interval,
                });
                if let Err(e) = self.poller.start().await {
                    log_call_failure("start poller", &e);
                }
            }
            Effect::StopPolling => {
                self.poller.stop().await;
                self.poller.configure(PollingConfig {
                    enabled: false,
                    interval: self.config.polling_interval,
                });
            }
            Effect::RejoinPushRooms => {
                let missing: Vec<String> = self
                    .tracked
                    .iter()
                    .filter(|id| !self.push_rooms.contains(*id))
                    .cloned()
                    .collect();
                for id in missing {
                    self.join_push_room(&id).await;
                }
            }
        }
    }

    async fn connect_push(&mut self) {
        let Some(user_id) = self.session.as_ref().map(|s| s.user_id.clone()) else {
            return;
        };
        if let Err(e) = self.push.connect(&user_id).await {
            log_call_failure("push connect", &e);
        }
    }

    fn publish_status(&self) {
        let status = self.phase.status();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!("connection indicator: {}", status.indicator());
        }
    }

    async fn on_transport_event(&mut self, source: Source, event: TransportEvent) {
        match (source, event) {
            (Source::Push, TransportEvent::ConnectionChanged(true)) => {
                info!("push channel connected");
                self.apply(Input::PushUp).await;
            }
            (Source::Push, TransportEvent::ConnectionChanged(false)) => {
                info!("push channel disconnected");
                // Outside PushActive the rooms belong to a newer connection
                // attempt; a restart already dropped the old ones.
                if self.phase == ConnectionPhase::PushActive {
                    self.push_rooms.clear();
                }
                self.apply(Input::PushDown).await;
            }
            (Source::Poller, TransportEvent::ConnectionChanged(up)) => {
                debug!("poller connection change ignored ({up})");
            }
            (_, TransportEvent::NewMessage(event)) => {
                if self.delivered.first_delivery(&event) {
                    self.subscribers.new_message.emit(&event);
                }
            }
            (_, TransportEvent::ConversationUpdate(event)) => {
                self.subscribers.conversation_update.emit(&event);
            }
            (Source::Poller, event) => {
                debug!("poller does not source {}, dropped", event.label());
            }
            (Source::Push, TransportEvent::Typing(event)) => self.on_typing(event),
            (Source::Push, TransportEvent::Presence(event)) => {
                let status = self.presence.apply(&event);
                self.subscribers
                    .presence
                    .emit(&PresenceUpdate { event, status });
            }
            (Source::Push, TransportEvent::MessageRead(event)) => {
                self.subscribers.read_receipt.emit(&event);
            }
        }
    }

    fn on_typing(&mut self, event: TypingEvent) {
        match event.kind {
            TypingKind::Start => {
                let commands = self.commands.clone();
                let expiry = self.config.typing_expiry;
                let conversation_id = event.conversation_id.clone();
                let user_id = event.user_id.clone();
                self.typing.start(
                    &event.conversation_id,
                    &event.user_id,
                    self.clock.now_ms(),
                    move |generation| {
                        schedule(
                            commands,
                            expiry,
                            Command::TypingExpired {
                                conversation_id,
                                user_id,
                                generation,
                            },
                        )
                    },
                );
            }
            TypingKind::Stop => {
                self.typing.stop(&event.conversation_id, &event.user_id);
            }
        }

        let update = TypingUpdate {
            typing: self.typing.conversation(&event.conversation_id),
            event,
            expired: false,
        };
        self.subscribers.typing.emit(&update);
    }

    fn expire_typing(&mut self, conversation_id: String, user_id: String, generation: u64) {
        if !self.typing.expire(&conversation_id, &user_id, generation) {
            return;
        }
        debug!("typing expired for {user_id} in {conversation_id}");
        let update = TypingUpdate {
            typing: self.typing.conversation(&conversation_id),
            event: TypingEvent::stop(conversation_id, user_id),
            expired: true,
        };
        self.subscribers.typing.emit(&update);
    }

    async fn send_typing(&mut self, conversation_id: &str, is_typing: bool) {
        if self.phase != ConnectionPhase::PushActive {
            debug!("push not active, typing signal for {conversation_id} dropped");
            return;
        }
        if let Err(e) = self.push.send_typing(conversation_id, is_typing).await {
            log_call_failure(&format!("send typing for {conversation_id}"), &e);
        }
    }

    async fn start_tracking(&mut self, ids: Vec<String>) {
        let added = self.tracked.add(ids);
        if added.is_empty() {
            return;
        }
        debug!("tracking {} new conversation(s)", added.len());
        if self.session.is_none() {
            return;
        }
        for id in &added {
            self.mirror_track(id).await;
        }
    }

    async fn mirror_track(&mut self, conversation_id: &str) {
        if self.config.push_enabled && !self.push_rooms.contains(conversation_id) {
            self.join_push_room(conversation_id).await;
        }
        if self.config.fallback_enabled {
            self.poller.track_conversation(conversation_id);
        }
    }

    async fn join_push_room(&mut self, conversation_id: &str) {
        match self.push.join_conversation(conversation_id).await {
            Ok(()) => {
                self.push_rooms.insert(conversation_id.to_string());
            }
            Err(e) => log_call_failure(&format!("join {conversation_id} on push"), &e),
        }
    }

    async fn stop_tracking(&mut self) {
        let ids = self.tracked.drain();
        if ids.is_empty() {
            return;
        }
        debug!("untracking {} conversation(s)", ids.len());
        if self.session.is_some() {
            for id in &ids {
                if self.config.push_enabled {
                    if let Err(e) = self.push.leave_conversation(id).await {
                        log_call_failure(&format!("leave {id} on push"), &e);
                    }
                }
                if self.config.fallback_enabled {
                    self.poller.untrack_conversation(id);
                }
            }
        }
        self.push_rooms.clear();
    }

    async fn teardown(&mut self) {
        let session = self.session.take();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.apply(Input::Teardown).await;

        self.typing.clear();
        self.presence.clear();
        self.delivered.clear();
        self.push_rooms.clear();
        let tracked = self.tracked.drain();

        let Some(session) = session else {
            return;
        };
        for id in &tracked {
            self.poller.untrack_conversation(id);
        }
        self.poller.stop().await;
        self.poller.configure(PollingConfig {
            enabled: false,
            interval: self.config.polling_interval,
        });
        if self.config.push_enabled {
            self.push.disconnect().await;
        }
        info!("sync session {} for {} torn down", session.id, session.user_id);
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            phase: self.phase,
            status: self.phase.status(),
            session_user: self.session.as_ref().map(|s| s.user_id.clone()),
            tracked: self.tracked.to_vec(),
            typing: self.typing.snapshot(),
            presence: self.presence.snapshot(),
            pending_timers: self.typing.pending_timers() + usize::from(self.connect_timer.is_some()),
        }
    }
}

/// Transport failures are expected and become state; anything else is a bug
/// in a transport implementation.
fn log_call_failure(action: &str, err: &RtError) {
    if err.is_transport() {
        warn!("{action} failed: {err}");
    } else {
        error!("{action} failed unexpectedly: {err}");
    }
}

/// Send `command` to the driver after `delay`, if it is still running.
fn schedule(
    commands: WeakUnboundedSender<Command>,
    delay: Duration,
    command: Command,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(commands) = commands.upgrade() {
            let _ = commands.send(command);
        }
    })
}

/// Forward one transport's events to the driver, tagged with the session epoch.
fn spawn_pump(
    source: Source,
    epoch: u64,
    mut events: broadcast::Receiver<TransportEvent>,
    commands: WeakUnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(commands) = commands.upgrade() else {
                        break;
                    };
                    if commands
                        .send(Command::Transport {
                            source,
                            epoch,
                            event,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{source} event pump lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("{source} event stream closed");
                    break;
                }
            }
        }
    })
}
