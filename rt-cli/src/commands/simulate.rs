//! Simulate command - replay a scenario against the engine.
//!
//! A scenario is a TOML file of timed steps: push link changes, raw frames
//! injected on either transport, and engine actions. The engine runs over
//! in-memory transports and every consumer callback and indicator change is
//! printed as it happens. By default the clock is virtual, so a scenario
//! spanning minutes finishes instantly with exact timestamps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use rt_core::config::AppConfig;
use rt_core::error::{RtError, RtResult};
use rt_engine::{EngineConfig, EngineSnapshot, Subscription, SyncEngine, TokioClock};
use rt_transport::{MemoryPoller, MemoryPushChannel, TransportEvent, TypingKind};

use crate::OutputFormat;

/// A scripted run.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Session user for `start` steps that name none.
    #[serde(default = "default_user")]
    pub user: String,
    /// Push reports connected as soon as the engine connects.
    #[serde(default)]
    pub auto_connect: bool,
    /// Keep running until this offset; defaults to the last step.
    #[serde(default)]
    pub run_for_ms: Option<u64>,
    #[serde(default)]
    pub engine: EngineOverrides,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

fn default_user() -> String {
    "user".to_string()
}

/// Per-scenario overrides of the configured engine settings.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineOverrides {
    pub push_enabled: Option<bool>,
    pub fallback_enabled: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub typing_expiry_ms: Option<u64>,
    pub polling_interval_ms: Option<u64>,
    pub dedupe_messages: Option<bool>,
}

impl EngineOverrides {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(enabled) = self.push_enabled {
            config.push_enabled = enabled;
        }
        if let Some(enabled) = self.fallback_enabled {
            config.fallback_enabled = enabled;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.typing_expiry_ms {
            config.typing_expiry = Duration::from_millis(ms);
        }
        if let Some(ms) = self.polling_interval_ms {
            config.polling_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.dedupe_messages {
            config.dedupe_messages = enabled;
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Offset from the start of the run.
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Start {
        #[serde(default)]
        user: Option<String>,
    },
    PushLink {
        up: bool,
    },
    /// Raw frame arriving on the push channel.
    PushEvent {
        event: String,
        payload: Value,
    },
    /// Event served by the poller on its next fetch.
    PollEvent {
        event: String,
        payload: Value,
    },
    Track {
        conversations: Vec<String>,
    },
    Untrack,
    SendTyping {
        conversation: String,
        typing: bool,
    },
    Reconnect,
    Disconnect,
}

impl Action {
    fn describe(&self) -> String {
        match self {
            Self::Start { user } => format!("start {}", user.as_deref().unwrap_or("")),
            Self::PushLink { up } => format!("push link {}", if *up { "up" } else { "down" }),
            Self::PushEvent { event, .. } => format!("push frame {event}"),
            Self::PollEvent { event, .. } => format!("poll frame {event}"),
            Self::Track { conversations } => format!("track {}", conversations.join(", ")),
            Self::Untrack => "untrack all".to_string(),
            Self::SendTyping {
                conversation,
                typing,
            } => format!("send typing {conversation} {typing}"),
            Self::Reconnect => "reconnect".to_string(),
            Self::Disconnect => "disconnect".to_string(),
        }
    }
}

impl Scenario {
    /// Parse a scenario; steps are ordered by offset, ties keep file order.
    pub fn from_toml(contents: &str) -> RtResult<Self> {
        let mut scenario: Scenario =
            toml::from_str(contents).map_err(|e| RtError::Scenario(e.to_string()))?;
        scenario.steps.sort_by_key(|step| step.at_ms);
        Ok(scenario)
    }

    pub fn load(path: &Path) -> RtResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    fn end_ms(&self) -> u64 {
        let last = self.steps.last().map_or(0, |step| step.at_ms);
        self.run_for_ms.map_or(last, |run_for| run_for.max(last))
    }
}

/// Prints timestamped lines in the chosen format.
struct Printer {
    format: OutputFormat,
    started: Instant,
}

impl Printer {
    fn line(&self, kind: &str, detail: &str, data: Value) {
        let at_ms = self.started.elapsed().as_millis();
        match self.format {
            OutputFormat::Json => {
                println!("{}", json!({ "at_ms": at_ms, "kind": kind, "data": data }));
            }
            OutputFormat::Text => {
                println!(
                    "{} {:<20} {}",
                    style(format!("[{at_ms:>7}ms]")).dim(),
                    style(kind).cyan(),
                    detail
                );
            }
        }
    }
}

/// Run the simulate command.
pub async fn run(
    config: &AppConfig,
    path: &Path,
    realtime: bool,
    format: OutputFormat,
) -> RtResult<()> {
    let scenario = Scenario::load(path)?;
    if !realtime {
        tokio::time::pause();
    }
    info!("replaying {} ({} steps)", path.display(), scenario.steps.len());

    let snapshot = simulate(config, &scenario, format).await?;
    let printer = Printer {
        format,
        started: Instant::now(),
    };
    match format {
        OutputFormat::Json => printer.line("summary", "", serde_json::to_value(&snapshot)?),
        OutputFormat::Text => print_summary(&snapshot),
    }
    Ok(())
}

/// Replay `scenario` and return the engine state at the end of the run.
pub async fn simulate(
    config: &AppConfig,
    scenario: &Scenario,
    format: OutputFormat,
) -> RtResult<EngineSnapshot> {
    let engine_config = scenario.engine.apply(EngineConfig::from(config));
    let capacity = config.engine.event_capacity;
    let push = if scenario.auto_connect {
        MemoryPushChannel::new(capacity).with_auto_connect()
    } else {
        MemoryPushChannel::new(capacity)
    };
    let push = Arc::new(push);
    let poller = Arc::new(MemoryPoller::new(capacity));
    // Typing timestamps are milliseconds since the scenario started.
    let clock = Arc::new(TokioClock::starting_at(0));
    let engine = SyncEngine::with_clock(push.clone(), poller.clone(), engine_config, clock);

    let printer = Arc::new(Printer {
        format,
        started: Instant::now(),
    });
    let subscriptions = subscribe_all(&engine, &printer);
    let watcher = watch_status(&engine, &printer);

    for step in &scenario.steps {
        tokio::time::sleep_until(printer.started + Duration::from_millis(step.at_ms)).await;
        let description = step.action.describe();
        printer.line("step", &style(&description).dim().to_string(), json!(description));
        apply_step(&step.action, scenario, &engine, &push, &poller, &printer)?;
    }
    tokio::time::sleep_until(printer.started + Duration::from_millis(scenario.end_ms())).await;

    // Processed in order after every earlier command.
    let snapshot = engine.snapshot().await;

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    engine.disconnect();
    let _ = engine.snapshot().await;
    watcher.abort();
    debug!("simulation finished");
    Ok(snapshot)
}

fn apply_step(
    action: &Action,
    scenario: &Scenario,
    engine: &SyncEngine,
    push: &MemoryPushChannel,
    poller: &MemoryPoller,
    printer: &Printer,
) -> RtResult<()> {
    match action {
        Action::Start { user } => {
            engine.start(user.clone().unwrap_or_else(|| scenario.user.clone()));
        }
        Action::PushLink { up } => push.set_link(*up),
        Action::PushEvent { event, payload } => {
            let raw = serde_json::to_string(payload)?;
            if !push.emit_raw(event, &raw) {
                printer.line("dropped", &format!("malformed push frame {event}"), payload.clone());
            }
        }
        Action::PollEvent { event, payload } => {
            match TransportEvent::decode(event, payload.clone()) {
                Ok(decoded) => {
                    if !poller.enqueue(decoded) {
                        printer.line("dropped", &format!("poller does not serve {event}"), Value::Null);
                    }
                }
                Err(e) => printer.line("dropped", &e.to_string(), payload.clone()),
            }
        }
        Action::Track { conversations } => engine.start_tracking(conversations.clone()),
        Action::Untrack => engine.stop_tracking(),
        Action::SendTyping {
            conversation,
            typing,
        } => engine.send_typing(conversation.clone(), *typing),
        Action::Reconnect => engine.reconnect(),
        Action::Disconnect => engine.disconnect(),
    }
    Ok(())
}

fn subscribe_all(engine: &SyncEngine, printer: &Arc<Printer>) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let p = Arc::clone(printer);
    subscriptions.push(engine.on_new_message(move |event| {
        p.line(
            "new_message",
            &format!("{} {}", event.conversation_id, event.message.id_text()),
            serde_json::to_value(event).unwrap_or_default(),
        );
    }));

    let p = Arc::clone(printer);
    subscriptions.push(engine.on_conversation_update(move |event| {
        let fields: Vec<&str> = event.conversation.keys().map(String::as_str).collect();
        p.line(
            "conversation_update",
            &format!("{} [{}]", event.conversation_id, fields.join(", ")),
            serde_json::to_value(event).unwrap_or_default(),
        );
    }));

    let p = Arc::clone(printer);
    subscriptions.push(engine.on_typing(move |update| {
        let verb = match (update.event.kind, update.expired) {
            (TypingKind::Start, _) => "started",
            (TypingKind::Stop, false) => "stopped",
            (TypingKind::Stop, true) => "expired",
        };
        let mut typing: Vec<&str> = update.typing.keys().map(String::as_str).collect();
        typing.sort_unstable();
        p.line(
            "typing",
            &format!(
                "{} {} {verb}, typing now [{}]",
                update.event.conversation_id,
                update.event.user_id,
                typing.join(", ")
            ),
            serde_json::to_value(update).unwrap_or_default(),
        );
    }));

    let p = Arc::clone(printer);
    subscriptions.push(engine.on_presence(move |update| {
        let state = if update.status.is_online {
            "online"
        } else {
            "offline"
        };
        p.line(
            "presence",
            &format!("{} {state}", update.event.user_id),
            serde_json::to_value(update).unwrap_or_default(),
        );
    }));

    let p = Arc::clone(printer);
    subscriptions.push(engine.on_read_receipt(move |receipt| {
        p.line("message_read", &receipt.0.to_string(), receipt.0.clone());
    }));

    subscriptions
}

fn watch_status(engine: &SyncEngine, printer: &Arc<Printer>) -> JoinHandle<()> {
    let mut status = engine.status_receiver();
    let printer = Arc::clone(printer);
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            printer.line(
                "status",
                &current.indicator().to_string(),
                serde_json::to_value(current).unwrap_or_default(),
            );
        }
    })
}

fn print_summary(snapshot: &EngineSnapshot) {
    println!();
    println!("{}", style("Final state").bold().underlined());
    println!("  phase            {}", snapshot.phase);
    println!("  indicator        {}", snapshot.status.indicator());
    println!("  tracked          [{}]", snapshot.tracked.join(", "));
    let typing: usize = snapshot.typing.values().map(|users| users.len()).sum();
    println!("  typing entries   {typing}");
    let online = snapshot.presence.values().filter(|s| s.is_online).count();
    println!("  users online     {online}/{}", snapshot.presence.len());
    println!("  pending timers   {}", snapshot.pending_timers);
}
