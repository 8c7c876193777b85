//! Typing-status derivation with per-pair expiry timers.
//!
//! Each (conversation, user) pair holds at most one entry and one pending
//! expiry timer. A new start cancels and replaces the timer; a stop removes
//! both. Every timer carries a generation so a timer that fires after being
//! replaced cannot remove the newer entry.

use std::collections::HashMap;

use serde::Serialize;
use tokio::task::JoinHandle;

/// One user's typing state inside a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypingEntry {
    pub is_typing: bool,
    /// When the start event was applied, epoch milliseconds.
    pub timestamp: i64,
}

/// conversation id -> user id -> entry.
pub type TypingStatus = HashMap<String, HashMap<String, TypingEntry>>;

type PairKey = (String, String);

struct PendingExpiry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TypingTracker {
    status: TypingStatus,
    timers: HashMap<PairKey, PendingExpiry>,
    next_generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a start event at `now_ms` and arm a fresh expiry timer.
    ///
    /// `schedule` receives the timer's generation and must return the
    /// spawned timer task; any previous timer for the pair is aborted.
    pub fn start<F>(&mut self, conversation_id: &str, user_id: &str, now_ms: i64, schedule: F) -> u64
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        self.status
            .entry(conversation_id.to_string())
            .or_default()
            .insert(
                user_id.to_string(),
                TypingEntry {
                    is_typing: true,
                    timestamp: now_ms,
                },
            );

        self.next_generation += 1;
        let generation = self.next_generation;
        let key = (conversation_id.to_string(), user_id.to_string());
        if let Some(previous) = self.timers.remove(&key) {
            previous.handle.abort();
        }
        let handle = schedule(generation);
        self.timers.insert(key, PendingExpiry { generation, handle });
        generation
    }

    /// Apply a stop event. Returns whether an entry was removed.
    pub fn stop(&mut self, conversation_id: &str, user_id: &str) -> bool {
        let key = (conversation_id.to_string(), user_id.to_string());
        if let Some(pending) = self.timers.remove(&key) {
            pending.handle.abort();
        }
        self.remove_entry(conversation_id, user_id)
    }

    /// Handle a fired timer. Only the timer that is still current for the
    /// pair removes the entry. Returns whether an entry was removed.
    pub fn expire(&mut self, conversation_id: &str, user_id: &str, generation: u64) -> bool {
        let key = (conversation_id.to_string(), user_id.to_string());
        match self.timers.get(&key) {
            Some(pending) if pending.generation == generation => {
                self.timers.remove(&key);
                self.remove_entry(conversation_id, user_id)
            }
            _ => false,
        }
    }

    fn remove_entry(&mut self, conversation_id: &str, user_id: &str) -> bool {
        let Some(users) = self.status.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.status.remove(conversation_id);
        }
        removed
    }

    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.status
            .get(conversation_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    /// Entries for one conversation.
    pub fn conversation(&self, conversation_id: &str) -> HashMap<String, TypingEntry> {
        self.status.get(conversation_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> TypingStatus {
        self.status.clone()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every timer and drop all entries.
    pub fn clear(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.handle.abort();
        }
        self.status.clear();
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}
