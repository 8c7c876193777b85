//! Time source for derived-state timestamps.

use chrono::Utc;
use tokio::time::Instant;

/// Milliseconds used to stamp typing entries.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock, epoch milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Follows the tokio clock from `origin_ms`, so it advances with paused
/// and auto-advanced time the same way the expiry timers do.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    started: Instant,
    origin_ms: i64,
}

impl TokioClock {
    /// Must be called from within a tokio runtime.
    pub fn starting_at(origin_ms: i64) -> Self {
        Self {
            started: Instant::now(),
            origin_ms,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}
