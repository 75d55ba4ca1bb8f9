// Callback hub - per-object publish/subscribe
//
// Every publisher owns one CallbackHub keyed by its own closed event enum.
// Each event variant is both the callback id and its argument payload, so a
// handler registered for an id always sees the right argument shape.
//
// Delivery is synchronous and in registration order. A handler may register
// or unregister subscribers (itself included) while a dispatch is running.

use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An event a publisher can fire. `id()` selects which subscribers see it.
pub trait CallbackEvent {
    type Id: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
}

/// Handle returned by `register`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E: CallbackEvent> {
    token: SubscriptionToken,
    id: E::Id,
    handler: Handler<E>,
}

pub struct CallbackHub<E: CallbackEvent> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
    dispatch_lock: ReentrantMutex<()>,
    next_token: AtomicU64,
}

impl<E: CallbackEvent> CallbackHub<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            dispatch_lock: ReentrantMutex::new(()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to events with the given id.
    pub fn register<F>(&self, id: E::Id, handler: F) -> SubscriptionToken
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber {
            token,
            id,
            handler: Arc::new(handler),
        });
        token
    }

    /// Returns false if the token was not (or no longer) registered.
    pub fn unregister(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.token != token);
        subscribers.len() != before
    }

    pub fn has_subscribers(&self, id: E::Id) -> bool {
        self.subscribers.lock().iter().any(|s| s.id == id)
    }

    pub fn subscriber_count(&self, id: E::Id) -> usize {
        self.subscribers.lock().iter().filter(|s| s.id == id).count()
    }

    /// Deliver `event` to every handler registered for its id.
    ///
    /// The subscriber list is snapshotted first. A handler unregistered by an
    /// earlier handler in the same dispatch is skipped; one registered during
    /// the dispatch only sees later events.
    pub fn fire(&self, event: &E) {
        let id = event.id();
        let snapshot: Vec<(SubscriptionToken, Handler<E>)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.id == id)
            .map(|s| (s.token, Arc::clone(&s.handler)))
            .collect();

        for (token, handler) in snapshot {
            let still_registered = self.subscribers.lock().iter().any(|s| s.token == token);
            if still_registered {
                handler(event);
            }
        }
    }

    /// Same as `fire`, serialized against other `fire_safe` dispatches on this hub.
    pub fn fire_safe(&self, event: &E) {
        let _guard = self.dispatch_lock.lock();
        self.fire(event);
    }
}

impl<E: CallbackEvent> Default for CallbackHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CallbackEvent> fmt::Debug for CallbackHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHub")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
