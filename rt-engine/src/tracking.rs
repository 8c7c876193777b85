//! Tracked conversation set.

use std::collections::BTreeSet;

/// Conversation ids the engine has asked its transports to monitor.
#[derive(Debug, Default)]
pub struct TrackedConversations {
    ids: BTreeSet<String>,
}

impl TrackedConversations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ids, returning only those not already tracked, in input order.
    pub fn add<I, S>(&mut self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter()
            .map(Into::into)
            .filter(|id| self.ids.insert(id.clone()))
            .collect()
    }

    /// Remove and return every tracked id.
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ids).into_iter().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
