use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    by_id: BTreeMap<u64, Listener<T>>,
}

/// Fan-out of values to registered callbacks.
///
/// Delivery is synchronous and best-effort: a callback that cannot deliver
/// (e.g. its connection went away) must swallow the failure itself. There is
/// no queueing for subscribers that are not registered at publish time.
///
/// Callbacks run outside the internal lock, so a callback may drop or
/// unsubscribe its own [`Subscription`] without deadlocking.
pub struct Broadcaster<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                by_id: BTreeMap::new(),
            })),
        }
    }

    /// Register `callback`, handing it `current` before returning.
    ///
    /// The caller is responsible for making `current` consistent with the
    /// stream of later publishes (the registry holds its own lock across
    /// this call for that reason).
    pub fn subscribe<F>(&self, current: &T, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(callback);
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.by_id.insert(id, Arc::clone(&listener));
            id
        };
        listener(current);
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver `value` to every current subscriber, in subscription order.
    pub fn publish(&self, value: &T) {
        let targets: Vec<Listener<T>> = self.listeners.lock().by_id.values().cloned().collect();
        for listener in targets {
            listener(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().by_id.len()
    }

    /// Drop every subscriber. Outstanding [`Subscription`]s become no-ops.
    pub fn clear(&self) {
        self.listeners.lock().by_id.clear();
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Broadcaster::subscribe`]. Unsubscribes on drop.
pub struct Subscription<T> {
    id: u64,
    listeners: Weak<Mutex<Listeners<T>>>,
}

impl<T> Subscription<T> {
    /// Stop receiving publishes. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().by_id.remove(&self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
