//! Listener registry shared by the subscription and polling producers.
//!
//! The registry is a copy-on-write list: `add` and `remove` publish a new
//! snapshot, and `deliver` iterates whatever snapshot was current when it
//! started. Removal also flips the entry's `active` flag, so a delivery that
//! is still walking an older snapshot skips listeners removed in the
//! meantime.
//!
//! `remove` does not wait for calls in progress: a listener whose call
//! already started on another thread finishes that one call. Deliveries
//! that reach the entry after `remove` returns skip it.

use crate::event::AttributeSet;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Consumer of attribute-set events.
pub trait AttributeListener: Send + Sync {
    /// Called once per observed event.
    fn on_attributes(&self, event: &AttributeSet);
}

impl<F> AttributeListener for F
where
    F: Fn(&AttributeSet) + Send + Sync,
{
    fn on_attributes(&self, event: &AttributeSet) {
        self(event);
    }
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    active: AtomicBool,
    listener: Arc<dyn AttributeListener>,
}

/// Concurrent set of listeners.
pub struct ListenerRegistry {
    entries: ArcSwap<Vec<Arc<Entry>>>,
    next_id: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn AttributeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            listener,
        });
        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&entry));
            next
        });
        tracing::debug!(listener_id = id.0, "Listener added");
        id
    }

    /// Deregister a listener.
    ///
    /// Returns `false` if the id was not registered. Once this returns, no
    /// delivery reaching the entry calls the listener. A call already
    /// running on another thread is not waited for.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = None;
        self.entries.rcu(|current| {
            removed = current.iter().find(|e| e.id == id).cloned();
            current
                .iter()
                .filter(|e| e.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });

        match removed {
            Some(entry) => {
                entry.active.store(false, Ordering::SeqCst);
                tracing::debug!(listener_id = id.0, "Listener removed");
                true
            }
            None => false,
        }
    }

    /// Hand an event to every registered listener.
    pub fn deliver(&self, event: &AttributeSet) {
        let snapshot = self.entries.load_full();
        for entry in snapshot.iter() {
            if entry.active.load(Ordering::SeqCst) {
                entry.listener.on_attributes(event);
            }
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// `true` if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

/// Listener that logs every event it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl AttributeListener for LoggingListener {
    fn on_attributes(&self, event: &AttributeSet) {
        tracing::info!(
            node_id = event.node_id().unwrap_or_default(),
            attributes = ?event,
            "Received OPC UA event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn AttributeListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Arc<dyn AttributeListener> = Arc::new(move |_: &AttributeSet| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    fn event() -> AttributeSet {
        AttributeSet::new().with(Attribute::NodeId, "n1")
    }

    #[test]
    fn delivers_to_all() {
        let registry = ListenerRegistry::new();
        let (a, la) = counter();
        let (b, lb) = counter();
        registry.add(la);
        registry.add(lb);

        registry.deliver(&event());

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_unknown_is_false() {
        let registry = ListenerRegistry::new();
        let (_, l) = counter();
        let id = registry.add(l);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn removal_during_delivery_skips_removed_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let (victim_count, victim) = counter();

        // The first listener removes the second while delivery is in progress.
        let victim_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let reg = Arc::clone(&registry);
        let vid = Arc::clone(&victim_id);
        registry.add(Arc::new(move |_: &AttributeSet| {
            if let Some(id) = vid.lock().unwrap().take() {
                reg.remove(id);
            }
        }));
        *victim_id.lock().unwrap() = Some(registry.add(victim));

        registry.deliver(&event());
        assert_eq!(victim_count.load(Ordering::SeqCst), 0);

        registry.deliver(&event());
        assert_eq!(victim_count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_on_other_thread_stops_later_deliveries() {
        let registry = Arc::new(ListenerRegistry::new());
        let (count, l) = counter();
        let id = registry.add(l);
        registry.deliver(&event());

        let reg = Arc::clone(&registry);
        assert!(std::thread::spawn(move || reg.remove(id)).join().unwrap());

        registry.deliver(&event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_during_delivery_does_not_panic() {
        let registry = Arc::new(ListenerRegistry::new());
        let reg = Arc::clone(&registry);
        registry.add(Arc::new(move |_: &AttributeSet| {
            reg.add(Arc::new(|_: &AttributeSet| {}));
        }));

        registry.deliver(&event());
        registry.deliver(&event());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn concurrent_add_remove_and_deliver() {
        let registry = Arc::new(ListenerRegistry::new());
        let (count, l) = counter();
        registry.add(l);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.add(Arc::new(|_: &AttributeSet| {}));
                        registry.deliver(&event());
                        registry.remove(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 400);
        assert_eq!(registry.len(), 1);
    }
}
