use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::Subscription;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Fan-out of engine callbacks to any number of subscribers.
///
/// Handlers are invoked outside the registry lock, so a handler may drop its
/// own subscription (or register another one) while being called.
pub struct ListenerSet<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: Clone + Send + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: Handler<T>) -> Subscription {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.insert(id, handler);
            id
        };
        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().handlers.remove(&id);
            }
        })
    }

    pub fn emit(&self, value: T) {
        let handlers: Vec<Handler<T>> = self.inner.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler(value.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// Drops every handler; outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }
}

impl<T: Clone + Send + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
