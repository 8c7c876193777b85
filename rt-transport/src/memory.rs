//! In-process transports.
//!
//! `MemoryPushChannel` and `MemoryPoller` satisfy the transport contracts
//! without any network. They record every outbound call and let the caller
//! drive connection changes and inject events, which is what the engine
//! tests and the scenario simulator need.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rt_core::error::{RtError, RtResult};

use crate::contract::{PollingClient, PollingConfig, PushChannel};
use crate::events::{TransportDispatcher, TransportEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An outbound call made on a `MemoryPushChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCall {
    Connect(String),
    Disconnect,
    SendTyping { conversation_id: String, is_typing: bool },
    Join(String),
    Leave(String),
}

#[derive(Default)]
struct PushInner {
    connected: bool,
    user_id: Option<String>,
    joined: BTreeSet<String>,
    calls: Vec<PushCall>,
}

/// Push channel whose link state is driven by the caller.
///
/// `connect` only records the attempt unless auto-connect is on; call
/// `set_link(true)` to report the connection as established.
pub struct MemoryPushChannel {
    dispatcher: TransportDispatcher,
    inner: Mutex<PushInner>,
    auto_connect: AtomicBool,
    fail_outbound: AtomicBool,
}

impl MemoryPushChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            dispatcher: TransportDispatcher::new(capacity),
            inner: Mutex::new(PushInner::default()),
            auto_connect: AtomicBool::new(false),
            fail_outbound: AtomicBool::new(false),
        }
    }

    /// Report the link as established as soon as `connect` is called.
    pub fn with_auto_connect(self) -> Self {
        self.auto_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Make typing and room calls fail, to exercise error paths.
    pub fn set_fail_outbound(&self, fail: bool) {
        self.fail_outbound.store(fail, Ordering::SeqCst);
    }

    /// Change the link state and publish the transition.
    pub fn set_link(&self, up: bool) {
        let changed = {
            let mut inner = lock(&self.inner);
            let changed = inner.connected != up;
            inner.connected = up;
            changed
        };
        if changed {
            info!("memory push link {}", if up { "up" } else { "down" });
            self.dispatcher.dispatch(TransportEvent::ConnectionChanged(up));
        }
    }

    /// Publish an event as if it came from the server.
    pub fn emit(&self, event: TransportEvent) {
        self.dispatcher.dispatch(event);
    }

    /// Decode and publish a raw frame; malformed frames are dropped.
    pub fn emit_raw(&self, event_name: &str, raw: &str) -> bool {
        self.dispatcher.dispatch_raw(event_name, raw)
    }

    pub fn calls(&self) -> Vec<PushCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        lock(&self.inner).joined.iter().cloned().collect()
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.inner).user_id.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| matches!(c, PushCall::Connect(_)))
            .count()
    }

    fn record(&self, call: PushCall) {
        lock(&self.inner).calls.push(call);
    }

    fn check_outbound(&self) -> RtResult<()> {
        if self.fail_outbound.load(Ordering::SeqCst) {
            return Err(RtError::PushChannel("outbound call rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PushChannel for MemoryPushChannel {
    async fn connect(&self, user_id: &str) -> RtResult<()> {
        {
            let mut inner = lock(&self.inner);
            inner.calls.push(PushCall::Connect(user_id.to_string()));
            inner.user_id = Some(user_id.to_string());
        }
        debug!("memory push connecting as {user_id}");
        if self.auto_connect.load(Ordering::SeqCst) {
            self.set_link(true);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.calls.push(PushCall::Disconnect);
            inner.user_id = None;
            inner.joined.clear();
        }
        self.set_link(false);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.dispatcher.subscribe()
    }

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> RtResult<()> {
        self.record(PushCall::SendTyping {
            conversation_id: conversation_id.to_string(),
            is_typing,
        });
        self.check_outbound()?;
        if !self.is_connected() {
            return Err(RtError::NotConnected);
        }
        Ok(())
    }

    async fn join_conversation(&self, conversation_id: &str) -> RtResult<()> {
        self.record(PushCall::Join(conversation_id.to_string()));
        self.check_outbound()?;
        lock(&self.inner).joined.insert(conversation_id.to_string());
        Ok(())
    }

    async fn leave_conversation(&self, conversation_id: &str) -> RtResult<()> {
        self.record(PushCall::Leave(conversation_id.to_string()));
        self.check_outbound()?;
        lock(&self.inner).joined.remove(conversation_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }
}

#[derive(Default)]
struct PollInner {
    config: PollingConfig,
    running: bool,
    tracked: BTreeSet<String>,
    pending: VecDeque<TransportEvent>,
    start_count: u32,
    stop_count: u32,
    fail_start: bool,
}

/// Poller that serves a queue of pending server events on each tick.
pub struct MemoryPoller {
    dispatcher: TransportDispatcher,
    inner: Arc<Mutex<PollInner>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryPoller {
    pub fn new(capacity: usize) -> Self {
        Self {
            dispatcher: TransportDispatcher::new(capacity),
            inner: Arc::new(Mutex::new(PollInner::default())),
            task: Mutex::new(None),
        }
    }

    /// Queue an event for the next fetch.
    ///
    /// Typing, presence, and read receipts are not served by polling and
    /// are dropped. Returns whether the event was queued.
    pub fn enqueue(&self, event: TransportEvent) -> bool {
        if event.kind().map_or(true, |kind| kind.is_push_only()) {
            debug!("poller does not serve {}, dropping", event.label());
            return false;
        }
        lock(&self.inner).pending.push_back(event);
        true
    }

    /// Publish a fetch result immediately.
    pub fn emit(&self, event: TransportEvent) {
        self.dispatcher.dispatch(event);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner).running
    }

    /// Make `start` fail as if the fetch endpoint were unreachable.
    pub fn set_fail_start(&self, fail: bool) {
        lock(&self.inner).fail_start = fail;
    }

    pub fn config(&self) -> PollingConfig {
        lock(&self.inner).config
    }

    pub fn start_count(&self) -> u32 {
        lock(&self.inner).start_count
    }

    pub fn stop_count(&self) -> u32 {
        lock(&self.inner).stop_count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.len()
    }
}

async fn poll_loop(inner: Arc<Mutex<PollInner>>, dispatcher: TransportDispatcher, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let batch: Vec<TransportEvent> = lock(&inner).pending.drain(..).collect();
        if !batch.is_empty() {
            debug!("poll fetched {} event(s)", batch.len());
        }
        for event in batch {
            dispatcher.dispatch(event);
        }
    }
}

#[async_trait]
impl PollingClient for MemoryPoller {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.dispatcher.subscribe()
    }

    fn configure(&self, config: PollingConfig) {
        lock(&self.inner).config = config;
    }

    async fn start(&self) -> RtResult<()> {
        let period = {
            let mut inner = lock(&self.inner);
            if !inner.config.enabled {
                debug!("poller disabled, not starting");
                return Ok(());
            }
            if inner.running {
                return Ok(());
            }
            if inner.fail_start {
                return Err(RtError::Polling("fetch endpoint unreachable".into()));
            }
            inner.running = true;
            inner.start_count += 1;
            inner.config.interval.max(Duration::from_millis(1))
        };

        info!("memory poller started ({}ms)", period.as_millis());
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.inner),
            self.dispatcher.clone(),
            period,
        ));
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.stop_count += 1;
        }
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
        info!("memory poller stopped");
    }

    fn is_enabled(&self) -> bool {
        lock(&self.inner).config.enabled
    }

    fn track_conversation(&self, conversation_id: &str) {
        lock(&self.inner).tracked.insert(conversation_id.to_string());
    }

    fn untrack_conversation(&self, conversation_id: &str) {
        lock(&self.inner).tracked.remove(conversation_id);
    }

    fn tracked_conversations(&self) -> Vec<String> {
        lock(&self.inner).tracked.iter().cloned().collect()
    }
}

impl Drop for MemoryPoller {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}
