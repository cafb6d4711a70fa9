use dashmap::DashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Mutation events published for pub/sub consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Set(String),
    Delete(String),
}

/// Why a key left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Deleted,
    Evicted,
    Expired,
}

pub type RemovalListener = Arc<dyn Fn(&str, RemovalCause) + Send + Sync>;

pub(crate) struct Notifier {
    listeners: Arc<DashMap<u64, RemovalListener>>,
    next_id: AtomicU64,
    events: broadcast::Sender<KeyEvent>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, RemovalCause) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Invokes every listener; a panicking listener is logged and skipped.
    pub(crate) fn removed(&self, key: &str, cause: RemovalCause) {
        if self.listeners.is_empty() {
            return;
        }
        // Clone out of the map so listeners may subscribe or unsubscribe re-entrantly.
        let listeners: Vec<RemovalListener> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(key, cause))).is_err() {
                tracing::warn!("Removal listener panicked for key {}", key);
            }
        }
    }

    pub(crate) fn publish(&self, event: KeyEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }
}

/// Handle returned by `subscribe`; the listener stays registered until this is
/// dropped or `unsubscribe` is called.
pub struct Subscription {
    id: u64,
    listeners: Weak<DashMap<u64, RemovalListener>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listener_receives_removals_until_unsubscribed() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let subscription = notifier.subscribe(move |key, cause| {
            sink.lock().push((key.to_string(), cause));
        });
        notifier.removed("a", RemovalCause::Deleted);
        subscription.unsubscribe();
        notifier.removed("b", RemovalCause::Evicted);

        assert_eq!(*seen.lock(), vec![("a".to_string(), RemovalCause::Deleted)]);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let notifier = Notifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();

        let _bad = notifier.subscribe(|_, _| panic!("listener failure"));
        let _good = notifier.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.removed("k", RemovalCause::Expired);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let notifier = Notifier::new();
        let mut rx = notifier.events();

        notifier.publish(KeyEvent::Set("k".to_string()));

        assert_eq!(rx.recv().await.unwrap(), KeyEvent::Set("k".to_string()));
    }
}
