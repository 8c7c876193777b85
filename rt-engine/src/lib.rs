//! rtsync Engine - hybrid push/polling synchronization.
//!
//! This crate merges a push channel and a polling fallback into one stream
//! of typed callbacks:
//! - Connection arbitration (push preferred, polling covers the gaps)
//! - Typing status with per-pair expiry timers
//! - Presence with last-seen
//! - Tracked conversations mirrored onto both transports
//! - Handoff de-duplication of new messages
//! - Idempotent callback subscriptions

pub mod arbitration;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod presence;
pub mod status;
pub mod subscription;
pub mod tracking;
pub mod typing;

// Re-export key types
pub use arbitration::ConnectionPhase;
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::EngineConfig;
pub use engine::{EngineSnapshot, PresenceUpdate, SyncEngine, TypingUpdate};
pub use presence::OnlineStatus;
pub use status::{ConnectionIndicator, ConnectionStatus};
pub use subscription::Subscription;
pub use typing::{TypingEntry, TypingStatus};
