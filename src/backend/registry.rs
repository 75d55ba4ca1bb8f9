// Object registry - process-wide bookkeeping of every live wrapper
//
// Wrappers register on creation and unregister on drop. Each kind hands out
// strictly increasing allocation indices, which makes leak reports stable
// across runs. Observers can subscribe to (un)registration of any kind.
//
// The registry can be shared process-wide through `acquire()` or built
// explicitly with `new()` and threaded through DeviceCreateInfo, which keeps
// tests isolated from each other.

use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use super::callback::{CallbackEvent, CallbackHub, SubscriptionToken};
use super::object::{ObjectIdentity, ObjectKind};

/// One live registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectAllocation {
    pub index: u32,
    pub identity: ObjectIdentity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryCallbackId {
    Registered(ObjectKind),
    AboutToBeUnregistered(ObjectKind),
}

pub enum RegistryEvent {
    /// Fired after the object was recorded. `object` is whatever the
    /// registering wrapper chose to publish (usually its own `Arc`).
    Registered {
        kind: ObjectKind,
        allocation: ObjectAllocation,
        object: Option<Arc<dyn Any + Send + Sync>>,
    },
    /// Fired before the object is forgotten. The identity must not be
    /// dereferenced: the wrapper is already being dropped.
    AboutToBeUnregistered {
        kind: ObjectKind,
        identity: ObjectIdentity,
    },
}

impl CallbackEvent for RegistryEvent {
    type Id = RegistryCallbackId;

    fn id(&self) -> RegistryCallbackId {
        match self {
            RegistryEvent::Registered { kind, .. } => RegistryCallbackId::Registered(*kind),
            RegistryEvent::AboutToBeUnregistered { kind, .. } => {
                RegistryCallbackId::AboutToBeUnregistered(*kind)
            }
        }
    }
}

#[derive(Default)]
struct KindEntries {
    next_index: u32,
    // Kept in registration order, which is also index order.
    live: Vec<ObjectAllocation>,
}

/// Registration and unregistration each run as one critical section under a
/// re-entrant lock, notifications included, so observers may query the
/// registry or create and drop objects of their own.
pub struct ObjectRegistry {
    entries: ReentrantMutex<RefCell<BTreeMap<ObjectKind, KindEntries>>>,
    callbacks: CallbackHub<RegistryEvent>,
}

static GLOBAL_REGISTRY: OnceLock<Mutex<Weak<ObjectRegistry>>> = OnceLock::new();

impl ObjectRegistry {
    /// Private registry, independent from the process-wide one.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: ReentrantMutex::new(RefCell::new(BTreeMap::new())),
            callbacks: CallbackHub::new(),
        })
    }

    /// Process-wide registry. The first call allocates it; once every handle
    /// has been released the next call allocates a fresh one.
    pub fn acquire() -> Arc<Self> {
        let mut global = GLOBAL_REGISTRY
            .get_or_init(|| Mutex::new(Weak::new()))
            .lock();

        if let Some(registry) = global.upgrade() {
            return registry;
        }

        log::debug!("Allocating process-wide object registry");
        let registry = Self::new();
        *global = Arc::downgrade(&registry);
        registry
    }

    /// Drop a handle obtained from `acquire()`. When it was the last one,
    /// any objects still registered are reported as leaks first.
    pub fn release(registry: Arc<Self>) {
        if Arc::strong_count(&registry) == 1 {
            registry.check_for_leaks();
        }
    }

    /// Record `identity` under `kind` and return its allocation index.
    ///
    /// Panics if the pair is already registered.
    pub fn register(
        &self,
        kind: ObjectKind,
        identity: ObjectIdentity,
        object: Option<Arc<dyn Any + Send + Sync>>,
    ) -> u32 {
        let guard = self.entries.lock();
        let allocation = {
            let mut entries = guard.borrow_mut();
            let entry = entries.entry(kind).or_default();

            assert!(
                !entry.live.iter().any(|a| a.identity == identity),
                "{} {:?} registered twice",
                kind,
                identity
            );

            let allocation = ObjectAllocation {
                index: entry.next_index,
                identity,
            };
            entry.next_index += 1;
            entry.live.push(allocation);
            allocation
        };

        log::trace!("Registered {} #{} ({:?})", kind, allocation.index, identity);

        let id = RegistryCallbackId::Registered(kind);
        if self.callbacks.has_subscribers(id) {
            self.callbacks.fire_safe(&RegistryEvent::Registered {
                kind,
                allocation,
                object,
            });
        }

        allocation.index
    }

    /// Forget `identity`. Observers are told before the entry is removed.
    ///
    /// Panics if the pair is not registered.
    pub fn unregister(&self, kind: ObjectKind, identity: ObjectIdentity) {
        let guard = self.entries.lock();
        let known = guard
            .borrow()
            .get(&kind)
            .map_or(false, |e| e.live.iter().any(|a| a.identity == identity));
        assert!(known, "{} {:?} unregistered but never registered", kind, identity);

        let id = RegistryCallbackId::AboutToBeUnregistered(kind);
        if self.callbacks.has_subscribers(id) {
            self.callbacks
                .fire_safe(&RegistryEvent::AboutToBeUnregistered { kind, identity });
        }

        let removed = guard.borrow_mut().get_mut(&kind).map_or(false, |entry| {
            let before = entry.live.len();
            entry.live.retain(|a| a.identity != identity);
            entry.live.len() < before
        });
        assert!(removed, "{} {:?} unregistered twice", kind, identity);
        log::trace!("Unregistered {} ({:?})", kind, identity);
    }

    pub fn subscribe<F>(&self, id: RegistryCallbackId, handler: F) -> SubscriptionToken
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(id, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.callbacks.unregister(token)
    }

    /// Every still-registered object, grouped by kind in index order.
    /// Each one is also logged as a warning.
    pub fn check_for_leaks(&self) -> Vec<(ObjectKind, ObjectAllocation)> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        let mut leaks = Vec::new();

        for (kind, entry) in entries.iter() {
            for allocation in &entry.live {
                log::warn!(
                    "Leaked {} #{} at {:?}",
                    kind,
                    allocation.index,
                    allocation.identity
                );
                leaks.push((*kind, *allocation));
            }
        }

        leaks
    }

    /// Identity of the live object that received `index`, if it is still alive.
    pub fn get_instance_at(&self, kind: ObjectKind, index: u32) -> Option<ObjectIdentity> {
        self.entries.lock().borrow().get(&kind).and_then(|entry| {
            entry
                .live
                .iter()
                .find(|a| a.index == index)
                .map(|a| a.identity)
        })
    }

    pub fn live_allocations(&self, kind: ObjectKind) -> Vec<ObjectAllocation> {
        self.entries
            .lock()
            .borrow()
            .get(&kind)
            .map(|e| e.live.clone())
            .unwrap_or_default()
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.entries.lock().borrow().get(&kind).map_or(0, |e| e.live.len())
    }

    pub fn is_registered(&self, kind: ObjectKind, identity: ObjectIdentity) -> bool {
        self.entries
            .lock()
            .borrow()
            .get(&kind)
            .map_or(false, |e| e.live.iter().any(|a| a.identity == identity))
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        let mut map = f.debug_map();
        for (kind, entry) in entries.iter() {
            map.entry(kind, &entry.live.len());
        }
        map.finish()
    }
}

/// Registers a wrapper for the lifetime of this value.
///
/// Wrappers embed one and fill it right after their `Arc` exists; dropping the
/// wrapper then unregisters it.
pub(crate) struct Registration {
    registry: Arc<ObjectRegistry>,
    kind: ObjectKind,
    identity: ObjectIdentity,
}

impl Registration {
    pub(crate) fn new<T: Any + Send + Sync>(
        registry: &Arc<ObjectRegistry>,
        kind: ObjectKind,
        object: &Arc<T>,
        publish: bool,
    ) -> Self {
        let identity = ObjectIdentity::of_arc(object);
        let payload = publish.then(|| Arc::clone(object) as Arc<dyn Any + Send + Sync>);
        registry.register(kind, identity, payload);
        Self {
            registry: Arc::clone(registry),
            kind,
            identity,
        }
    }

    /// Register `object` and park the guard in its own `slot`.
    pub(crate) fn attach<T: Any + Send + Sync>(
        slot: &OnceLock<Registration>,
        registry: &Arc<ObjectRegistry>,
        kind: ObjectKind,
        object: &Arc<T>,
    ) {
        let registered = slot.set(Self::new(registry, kind, object, false)).is_ok();
        debug_assert!(registered, "{} registered from two places", kind);
    }

    /// Like `attach`, but observers of the registration receive the object.
    pub(crate) fn attach_published<T: Any + Send + Sync>(
        slot: &OnceLock<Registration>,
        registry: &Arc<ObjectRegistry>,
        kind: ObjectKind,
        object: &Arc<T>,
    ) {
        let registered = slot.set(Self::new(registry, kind, object, true)).is_ok();
        debug_assert!(registered, "{} registered from two places", kind);
    }

    pub(crate) fn identity(&self) -> ObjectIdentity {
        self.identity
    }

    pub(crate) fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.kind, self.identity);
    }
}
