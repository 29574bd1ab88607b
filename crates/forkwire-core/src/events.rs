use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct HubInner<E> {
    listeners: Mutex<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
}

/// Small synchronous publish/subscribe primitive.
///
/// Listeners are invoked in subscription order, outside the internal lock so
/// a listener may subscribe or cancel reentrantly. Cloning the hub shares
/// the listener list.
pub struct EventHub<E> {
    inner: Arc<HubInner<E>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener. The returned [`Subscription`] removes it.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription
    where
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<HubInner<E>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Deliver `event` to every current listener, in subscription order.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Callback<E>> = {
            let guard = self.inner.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }
}

/// Cancellation value returned by subscription-style registrations.
///
/// `cancel` is idempotent; dropping the subscription without cancelling
/// leaves the listener registered for the lifetime of its hub.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Remove the listener. Subsequent calls are no-ops.
    pub fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_in_subscription_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        let _a = hub.subscribe(move |e| first.lock().push(("a", *e)));
        let second = Arc::clone(&seen);
        let _b = hub.subscribe(move |e| second.lock().push(("b", *e)));

        hub.emit(&7);
        assert_eq!(&*seen.lock(), &[("a", 7), ("b", 7)]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let hub = EventHub::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = hub.subscribe(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&());
        sub.cancel();
        sub.cancel();
        hub.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sub.is_cancelled());
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn listener_may_subscribe_reentrantly() {
        let hub = EventHub::<()>::new();
        let inner_hub = hub.clone();
        let _sub = hub.subscribe(move |()| {
            let _nested = inner_hub.subscribe(|()| {});
        });
        hub.emit(&());
        assert_eq!(hub.listener_count(), 2);
    }
}
