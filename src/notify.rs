use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Registry<T> = Mutex<Vec<(u64, Callback<T>)>>;

/// Listener registry shared by the queue and the state manager.
///
/// `notify` iterates over a snapshot of the registered callbacks taken
/// before any of them run, so a listener that unsubscribes itself from
/// inside its own callback neither skips nor double-notifies its peers.
pub struct Listeners<T> {
    registry: Arc<Registry<T>>,
    next_id: AtomicU64,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener. Dropping the returned handle removes it.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_registry(&self.registry).push((id, Arc::new(listener)));

        let registry = Arc::downgrade(&self.registry);
        Subscription {
            cleanup: Some(Box::new(move || {
                if let Some(registry) = Weak::upgrade(&registry) {
                    lock_registry(&registry).retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        // Snapshot first; the lock is released before any callback runs.
        let snapshot: Vec<Callback<T>> = lock_registry(&self.registry)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn clear(&self) {
        lock_registry(&self.registry).clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock_registry(&self.registry).len()
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_registry<T>(registry: &Registry<T>) -> std::sync::MutexGuard<'_, Vec<(u64, Callback<T>)>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by `subscribe`. The listener stays registered for as
/// long as the handle is alive.
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Explicitly remove the listener. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notifies_all_listeners() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = listeners.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = listeners.subscribe(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        listeners.notify(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_removes_listener() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = listeners.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 1);

        sub.unsubscribe();
        assert_eq!(listeners.len(), 0);

        listeners.notify(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_can_unsubscribe_itself_mid_notify() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_cb = slot.clone();
        let h1 = hits.clone();
        let sub = listeners.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
            // Remove ourselves while the notification is in flight.
            drop(slot_in_cb.lock().unwrap().take());
        });
        *slot.lock().unwrap() = Some(sub);

        let h2 = hits.clone();
        let _other = listeners.subscribe(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        listeners.notify(&1);
        // Both listeners saw the first notification.
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        listeners.notify(&2);
        // Only the surviving listener sees the second.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
