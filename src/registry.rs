//! Process-wide deduplication of observers.
//!
//! Subscriptions whose queries share a [`Signature`] share one [`Observer`].
//! Each entry counts the handles holding it; the last
//! [`ObserveHandle::stop`] kills the observer and evicts it, so a later
//! subscription with the same signature starts from a fresh initial fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Messenger;
use crate::error::Result;
use crate::observer::listener::{Listener, ListenerId};
use crate::observer::{Observer, ObserverInit, Snapshot};
use crate::signature::Signature;
use crate::store::DocumentStore;
use crate::types::ObserveOptions;

struct Entry {
    observer: Arc<Observer>,
    refs: usize,
}

pub(crate) struct RegistryShared {
    messenger: Arc<dyn Messenger>,
    observers: Mutex<HashMap<Signature, Entry>>,
    next_serial: AtomicU64,
}

impl RegistryShared {
    /// Drop one reference to `observer`; the last one kills it.
    pub(crate) fn release(&self, signature: &Signature, observer: &Observer) {
        let last = {
            let mut observers = self.observers.lock();
            match observers.get_mut(signature) {
                Some(entry) if std::ptr::eq(Arc::as_ptr(&entry.observer), observer) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        observers.remove(signature);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if last {
            observer.kill();
        }
    }

    /// Forget `observer` if it is still the one registered for `signature`.
    pub(crate) fn evict(&self, signature: &Signature, observer: &Observer) {
        let mut observers = self.observers.lock();
        if observers
            .get(signature)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry.observer), observer))
        {
            observers.remove(signature);
        }
    }
}

/// Entry point for live queries.
///
/// Cloning is cheap and clones share the same observers.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
}

impl Registry {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                messenger,
                observers: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Observe the documents of `store` matching `options`.
    ///
    /// Reuses the live observer for an identical query, otherwise creates
    /// one. The listener first receives `added` for every current document,
    /// then live events until the handle is stopped.
    pub fn subscribe(
        &self,
        store: Arc<dyn DocumentStore>,
        options: ObserveOptions,
        listener: Arc<dyn Listener>,
    ) -> Result<ObserveHandle> {
        let (signature, selector, channel) = Signature::compute(store.name(), &options);
        let retain = !listener.is_empty();

        let observer = {
            let mut observers = self.shared.observers.lock();
            match observers.get_mut(&signature) {
                Some(entry) => {
                    if retain {
                        entry.refs += 1;
                    }
                    Arc::clone(&entry.observer)
                }
                None => {
                    let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
                    let observer = Observer::new(
                        ObserverInit {
                            signature: signature.clone(),
                            key: format!("{serial}:{signature}"),
                            channel,
                            selector,
                            store,
                            messenger: Arc::clone(&self.shared.messenger),
                            registry: Arc::downgrade(&self.shared),
                        },
                        &options,
                    )?;
                    // Nothing would ever stop an observer nobody listens to.
                    if retain {
                        observer.initialize();
                        observers.insert(
                            signature.clone(),
                            Entry {
                                observer: Arc::clone(&observer),
                                refs: 1,
                            },
                        );
                    }
                    observer
                }
            }
        };

        if !retain {
            tracing::debug!(signature = %signature, "listener has no callbacks; not attached");
            return Ok(ObserveHandle::detached(
                Arc::downgrade(&self.shared),
                signature,
                observer,
            ));
        }

        match observer.add_listener(listener) {
            Ok(listener_id) => Ok(ObserveHandle {
                registry: Arc::downgrade(&self.shared),
                signature,
                observer,
                listener_id,
                stopped: AtomicBool::new(false),
            }),
            Err(e) => {
                self.shared.release(&signature, &observer);
                Err(e.into())
            }
        }
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.shared.observers.lock().contains_key(signature)
    }

    /// Handles currently holding the observer for `signature`.
    pub fn ref_count(&self, signature: &Signature) -> usize {
        self.shared
            .observers
            .lock()
            .get(signature)
            .map_or(0, |entry| entry.refs)
    }

    pub fn observer(&self, signature: &Signature) -> Option<Arc<Observer>> {
        self.shared
            .observers
            .lock()
            .get(signature)
            .map(|entry| Arc::clone(&entry.observer))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("observers", &self.observer_count())
            .finish()
    }
}

// ============================================================================
// ObserveHandle
// ============================================================================

/// One subscription. Dropping the handle does not stop it; call
/// [`stop`](Self::stop).
pub struct ObserveHandle {
    registry: Weak<RegistryShared>,
    signature: Signature,
    observer: Arc<Observer>,
    listener_id: Option<ListenerId>,
    stopped: AtomicBool,
}

impl ObserveHandle {
    fn detached(registry: Weak<RegistryShared>, signature: Signature, observer: Arc<Observer>) -> Self {
        Self {
            registry,
            signature,
            observer,
            listener_id: None,
            stopped: AtomicBool::new(true),
        }
    }

    /// Detach the listener; the last handle of an observer kills it.
    /// Safe to call more than once, and from inside a callback.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(id) = self.listener_id else {
            return;
        };
        // A queued attach that failed has already given its reference back.
        if !self.observer.remove_listener(id) {
            return;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.signature, &self.observer),
            None => self.observer.kill(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        self.listener_id
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    /// Live view of the observer's cache.
    pub fn snapshot(&self) -> Snapshot {
        self.observer.snapshot()
    }
}

impl std::fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("signature", &self.signature)
            .field("listener_id", &self.listener_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
