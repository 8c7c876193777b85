//! Callback registries for consumer subscriptions.
//!
//! Each event category has its own registry. Delivery iterates a snapshot
//! of the registered callbacks, so a callback may unsubscribe itself or
//! others mid-delivery. A panicking callback is logged and skipped; the
//! remaining subscribers still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entries<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait Unregister: Send + Sync {
    fn unregister(&self, id: u64) -> bool;
}

impl<T: 'static> Unregister for Mutex<Entries<T>> {
    fn unregister(&self, id: u64) -> bool {
        let mut entries = lock(self);
        let before = entries.callbacks.len();
        entries.callbacks.retain(|(entry_id, _)| *entry_id != id);
        entries.callbacks.len() != before
    }
}

/// Registry of callbacks for one event category.
pub struct CallbackRegistry<T> {
    category: &'static str,
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T: 'static> CallbackRegistry<T> {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            entries: Arc::new(Mutex::new(Entries {
                next_id: 1,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// subscription is unsubscribed; dropping the handle does not remove it.
    pub fn register<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut entries = lock(&self.entries);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, Arc::new(callback)));
            id
        };
        debug!("{} subscription {id} registered", self.category);

        let weak: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        let registry: Weak<dyn Unregister> = weak;
        Subscription {
            inner: Arc::new(SubscriptionInner {
                id,
                category: self.category,
                active: AtomicBool::new(true),
                registry,
            }),
        }
    }

    /// Deliver `event` to every callback registered at the time of the call.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = lock(&self.entries)
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        let mut delivered = 0;
        for callback in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("{} subscriber panicked, continuing delivery", self.category),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SubscriptionInner {
    id: u64,
    category: &'static str,
    active: AtomicBool,
    registry: Weak<dyn Unregister>,
}

/// Handle to one registered callback.
///
/// Clones share the same registration. `unsubscribe` is idempotent and may
/// be called from inside the callback it removes.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            if registry.unregister(self.inner.id) {
                debug!("{} subscription {} removed", self.inner.category, self.inner.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn category(&self) -> &'static str {
        self.inner.category
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("category", &self.inner.category)
            .field("active", &self.is_active())
            .finish()
    }
}
