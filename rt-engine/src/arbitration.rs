//! Transport arbitration state machine.
//!
//! Pure transition table: given the current phase and an input, returns the
//! next phase and the side effects the engine must carry out. Push is always
//! preferred; polling only covers the gaps.

use serde::Serialize;

use crate::status::ConnectionStatus;

/// Arbitration phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No transport is serving events.
    #[default]
    Idle,
    /// Waiting for the push channel to confirm, connect timer armed.
    ConnectingPush,
    /// Push channel is up and authoritative.
    PushActive,
    /// Poller is serving; push may still be reconnecting in the background.
    PollingActive,
}

impl ConnectionPhase {
    /// Connection flags implied by this phase.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            push_channel_up: *self == Self::PushActive,
            polling_up: *self == Self::PollingActive,
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ConnectingPush => write!(f, "connecting_push"),
            Self::PushActive => write!(f, "push_active"),
            Self::PollingActive => write!(f, "polling_active"),
        }
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A session started.
    SessionStart { push_enabled: bool },
    /// The connect timer fired.
    ConnectTimeout,
    /// The push channel reported `connected = true`.
    PushUp,
    /// The push channel reported `connected = false`.
    PushDown,
    /// A fresh push attempt was requested.
    Reconnect,
    /// The session was torn down.
    Teardown,
}

/// Side effects of a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ConnectPush,
    /// Drop the current push connection and connect again.
    RestartPush,
    ArmConnectTimer,
    CancelConnectTimer,
    StartPolling,
    StopPolling,
    /// Join tracked rooms the fresh push connection has not joined yet.
    RejoinPushRooms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionPhase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionPhase, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }

    fn stay(phase: ConnectionPhase) -> Self {
        Self::to(phase, &[])
    }
}

/// Compute the transition for `input` in `phase`.
pub fn transition(phase: ConnectionPhase, input: Input, fallback_enabled: bool) -> Transition {
    use ConnectionPhase::*;
    use Effect::*;

    match (phase, input) {
        (_, Input::Teardown) => Transition::to(Idle, &[CancelConnectTimer]),

        (Idle, Input::SessionStart { push_enabled: true }) => {
            Transition::to(ConnectingPush, &[ConnectPush, ArmConnectTimer])
        }
        (Idle, Input::SessionStart { push_enabled: false }) if fallback_enabled => {
            Transition::to(PollingActive, &[StartPolling])
        }
        (_, Input::SessionStart { .. }) => Transition::stay(phase),

        (ConnectingPush, Input::ConnectTimeout) if fallback_enabled => {
            Transition::to(PollingActive, &[StartPolling])
        }
        (_, Input::ConnectTimeout) => Transition::stay(phase),

        (PushActive, Input::PushUp) => Transition::stay(phase),
        (PollingActive, Input::PushUp) => {
            Transition::to(PushActive, &[CancelConnectTimer, StopPolling, RejoinPushRooms])
        }
        (Idle | ConnectingPush, Input::PushUp) => {
            Transition::to(PushActive, &[CancelConnectTimer, RejoinPushRooms])
        }

        (PushActive, Input::PushDown) if fallback_enabled => {
            Transition::to(PollingActive, &[StartPolling])
        }
        (PushActive, Input::PushDown) => Transition::to(Idle, &[]),
        (_, Input::PushDown) => Transition::stay(phase),

        (PollingActive, Input::Reconnect) => Transition::to(PollingActive, &[RestartPush]),
        (Idle | ConnectingPush | PushActive, Input::Reconnect) => {
            Transition::to(ConnectingPush, &[RestartPush, ArmConnectTimer])
        }
    }
}
