//! Handoff deduplication of new-message events.
//!
//! During a transport handoff the same message can arrive from the poller
//! and then from the push channel. A bounded history of recently delivered
//! `conversation:message` keys filters the repeat.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use rt_transport::NewMessageEvent;

#[derive(Debug)]
pub struct DeliveredMessages {
    enabled: bool,
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DeliveredMessages {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
        }
    }

    /// Record a delivery. Returns `false` if the message was already delivered.
    pub fn first_delivery(&mut self, event: &NewMessageEvent) -> bool {
        if !self.enabled || self.capacity == 0 {
            return true;
        }
        let key = event.dedup_key();
        if self.seen.contains(&key) {
            debug!("duplicate new_message skipped: {key}");
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
