//! Listener lists backing every `subscribe(callback)` surface of the engine.
//!
//! Listeners are invoked synchronously, in registration order, on the thread
//! that emits the event. Emission snapshots the list so callbacks may
//! subscribe or unsubscribe freely, and each callback's liveness is checked
//! again right before it is invoked: a listener removed mid-dispatch never
//! sees the event being dispatched.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

struct Registry<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

impl<T> Registry<T> {
    fn remove(&mut self, id: u64) {
        self.entries.retain(|entry| entry.id != id);
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    // A panicking listener never holds this lock, so poisoning is benign.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An ordered list of callbacks for events of type `T`.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    /// Create an empty listener list.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push(Entry {
                id,
                active: active.clone(),
                callback: Arc::new(callback),
            });
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            active,
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).remove(id);
                }
            })),
        }
    }

    /// Invoke every live listener with `event`.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run. Returns the number of listeners that completed normally.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Callback<T>)> = lock(&self.registry)
            .entries
            .iter()
            .map(|entry| (entry.active.clone(), entry.callback.clone()))
            .collect();

        let mut delivered = 0;
        for (active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Listener panicked while handling an event"),
            }
        }
        delivered
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

/// Handle for a registered listener; unsubscribes on drop.
pub struct Subscription {
    active: Arc<AtomicBool>,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister the listener now.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn cancel(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = listeners.subscribe(move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = seen.clone();
        let _b = listeners.subscribe(move |v| s2.lock().unwrap().push(("b", *v)));

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let listeners = Listeners::<u32>::new();
        let sub = listeners.subscribe(|_| {});
        assert_eq!(listeners.len(), 1);
        drop(sub);
        assert!(listeners.is_empty());
        assert_eq!(listeners.emit(&1), 0);
    }

    #[test]
    fn test_unsubscribe_during_emit_skips_removed_listener() {
        let listeners = Listeners::<u32>::new();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let victim_slot = victim.clone();
        let _killer = listeners.subscribe(move |_| {
            if let Some(sub) = victim_slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });

        let c = calls.clone();
        let sub = listeners.subscribe(move |v| c.lock().unwrap().push(*v));
        *victim.lock().unwrap() = Some(sub);

        listeners.emit(&1);
        listeners.emit(&2);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let listeners = Listeners::<u32>::new();
        let calls = Arc::new(Mutex::new(0));

        let _bad = listeners.subscribe(|_| panic!("boom"));
        let c = calls.clone();
        let _good = listeners.subscribe(move |_| *c.lock().unwrap() += 1);

        assert_eq!(listeners.emit(&1), 1);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_subscription_outliving_listeners_is_harmless() {
        let listeners = Listeners::<u32>::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        assert!(sub.is_active());
        sub.unsubscribe();
    }
}
