/// Connection lifecycle events and their fan-out.
///
/// Dispatch is synchronous and in registration order on the connection's
/// dispatcher task. A panicking subscriber is caught and logged; it never
/// reaches sibling subscribers or the I/O loop.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::Error;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport is connected; negotiation is starting.
    Connected,
    /// Resource binding finished and the session is usable. `resumed` is
    /// reserved for stream resumption and always false here.
    Authenticated { resumed: bool },
    /// The connection closed because `disconnect()` was called.
    ConnectionClosed,
    /// The connection closed because something failed.
    ConnectionClosedOnError { cause: Arc<Error> },
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

pub struct EventDispatcher {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn dispatch(&self, event: &ConnectionEvent) {
        // Snapshot under the lock, call outside it: a subscriber may
        // add or remove listeners from its callback.
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("event listener panicked; continuing with remaining listeners");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_reaches_all_listeners_in_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            dispatcher.add(move |_| order.lock().unwrap().push(tag));
        }
        dispatcher.dispatch(&ConnectionEvent::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_siblings() {
        let dispatcher = EventDispatcher::new();
        let reached = Arc::new(AtomicUsize::new(0));
        dispatcher.add(|_| panic!("listener bug"));
        let reached_clone = reached.clone();
        dispatcher.add(move |_| {
            reached_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(&ConnectionEvent::ConnectionClosed);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = dispatcher.add(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(&ConnectionEvent::Connected);
        assert!(dispatcher.remove(id));
        dispatcher.dispatch(&ConnectionEvent::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.remove(id));
    }

    #[test]
    fn test_error_cause_is_shared() {
        let cause = Arc::new(Error::Network("kicked".into()));
        let event = ConnectionEvent::ConnectionClosedOnError {
            cause: cause.clone(),
        };
        let seen = Arc::new(Mutex::new(String::new()));
        let dispatcher = EventDispatcher::new();
        let seen_clone = seen.clone();
        dispatcher.add(move |e| {
            if let ConnectionEvent::ConnectionClosedOnError { cause } = e {
                *seen_clone.lock().unwrap() = cause.to_string();
            }
        });
        dispatcher.dispatch(&event);
        assert!(seen.lock().unwrap().contains("kicked"));
    }
}
