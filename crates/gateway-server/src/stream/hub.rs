//! Stream Hub - fan-out of task and conversation events to live listeners

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::gateway::protocol::StreamEvent;

type Listener = Box<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    listeners: HashMap<String, Vec<(u64, Listener)>>,
}

impl HubInner {
    fn remove(&mut self, key: &str, id: u64) -> bool {
        let Some(entries) = self.listeners.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(listener_id, _)| *listener_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(key);
        }
        removed
    }
}

/// Every listener registered under a key sees every event published to it.
///
/// Listeners are invoked synchronously under the hub lock, so they must only
/// hand the event off (e.g. push into a channel) and never call back into
/// the hub.
#[derive(Clone, Default)]
pub struct StreamHub {
    inner: Arc<Mutex<HubInner>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `key` (a conversation id or task id).
    ///
    /// Dropping or calling [`Subscription::unsubscribe`] on the returned guard
    /// removes the listener before returning.
    pub fn register_listener<F>(&self, key: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Box::new(callback)));
        debug!("Listener {} registered for {}", id, key);

        Subscription {
            hub: Arc::downgrade(&self.inner),
            key,
            id,
            active: true,
        }
    }

    /// Deliver `event` to every listener under `key` and return how many saw
    /// it. Terminal events (`done`/`error`) also drop all of the key's
    /// listeners.
    pub fn publish(&self, key: &str, event: &StreamEvent) -> usize {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.listeners.get(key) else {
            return 0;
        };

        for (_, listener) in entries {
            listener(event);
        }
        let delivered = entries.len();

        if event.event_type.is_terminal() {
            inner.listeners.remove(key);
            debug!("Closed {} listener(s) for {} on {}", delivered, key, event.event_type.as_str());
        }
        delivered
    }

    #[cfg(test)]
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.lock().listeners.values().map(Vec::len).sum()
    }
}

/// Handle returned by [`StreamHub::register_listener`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<Mutex<HubInner>>,
    key: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Remove the listener. No delivery reaches it after this returns.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(hub) = self.hub.upgrade() {
            if hub.lock().remove(&self.key, self.id) {
                debug!("Listener {} unsubscribed from {}", self.id, self.key);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gateway::protocol::StreamEventType;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&StreamEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, move |_: &StreamEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn progress() -> StreamEvent {
        StreamEvent::conversation(StreamEventType::Progress, "working")
    }

    #[test]
    fn fans_out_to_every_listener() {
        let hub = StreamHub::new();
        let (a, listener_a) = counter();
        let (b, listener_b) = counter();
        let _sub_a = hub.register_listener("conv-1", listener_a);
        let _sub_b = hub.register_listener("conv-1", listener_b);

        assert_eq!(hub.publish("conv-1", &progress()), 2);
        assert_eq!(hub.publish("conv-1", &progress()), 2);
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn keys_are_isolated() {
        let hub = StreamHub::new();
        let (count, listener) = counter();
        let _sub = hub.register_listener("conv-1", listener);

        assert_eq!(hub.publish("conv-2", &progress()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_immediately_stops_delivery() {
        let hub = StreamHub::new();
        let (count, listener) = counter();
        let sub = hub.register_listener("conv-1", listener);
        sub.unsubscribe();

        assert_eq!(hub.publish("conv-1", &progress()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(hub.total_listeners(), 0);
    }

    #[test]
    fn terminal_event_unsubscribes_all_listeners() {
        let hub = StreamHub::new();
        let (count, listener) = counter();
        let sub = hub.register_listener("task-1", listener);

        let done = StreamEvent::conversation(StreamEventType::Done, "finished");
        assert_eq!(hub.publish("task-1", &done), 1);
        assert_eq!(hub.listener_count("task-1"), 0);

        assert_eq!(hub.publish("task-1", &progress()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Late unsubscribe after the implicit one is a no-op.
        sub.unsubscribe();
    }

    #[test]
    fn count_returns_to_zero_after_all_disconnect() {
        let hub = StreamHub::new();
        let subs: Vec<Subscription> = (0..5)
            .map(|i| hub.register_listener(format!("conv-{}", i % 2), |_| {}))
            .collect();
        assert_eq!(hub.total_listeners(), 5);

        drop(subs);
        assert_eq!(hub.total_listeners(), 0);
        assert_eq!(hub.listener_count("conv-0"), 0);
    }
}
