//! The live observer for one canonical query.
//!
//! An [`Observer`] owns a cache of the documents matching its query, keeps it
//! current from channel notifications, and fans out `added` / `changed` /
//! `removed` events to every attached listener.
//!
//! Processing is serialized per observer: exactly one thread at a time runs
//! the drain loop. Anything arriving while the loop is busy, or while the
//! observer is paused, waits in a FIFO queue. Reconciliation happens under the
//! state lock; events are dispatched with the lock released, so callbacks may
//! attach, detach, or publish freely.

pub mod listener;
pub(crate) mod reconcile;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::{Messenger, NotificationSink};
use crate::error::{ConfigError, StoreError};
use crate::notification::Notification;
use crate::registry::RegistryShared;
use crate::signature::Signature;
use crate::store::DocumentStore;
use crate::types::{DocId, Document, ObserveOptions};

use listener::{Listener, ListenerId, ListenerSet, ObserverEvent};
use reconcile::{ObservedQuery, ObserverState, Pending};

/// Everything needed to build an [`Observer`].
pub(crate) struct ObserverInit {
    pub signature: Signature,
    /// Unique per observer instance; the messenger routes on it.
    pub key: String,
    pub channel: String,
    pub selector: Value,
    pub store: Arc<dyn DocumentStore>,
    pub messenger: Arc<dyn Messenger>,
    pub registry: Weak<RegistryShared>,
}

pub struct Observer {
    signature: Signature,
    key: String,
    channel: String,
    query: ObservedQuery,
    store: Arc<dyn DocumentStore>,
    messenger: Arc<dyn Messenger>,
    registry: Weak<RegistryShared>,
    listeners: ListenerSet,
    state: Mutex<ObserverState>,
}

impl Observer {
    /// Compile the query. Fails on a projection the observer cannot serve.
    ///
    /// The observer does not receive notifications until
    /// [`initialize`](Self::initialize) registers it with the messenger.
    pub(crate) fn new(init: ObserverInit, options: &ObserveOptions) -> Result<Arc<Self>, ConfigError> {
        let query = ObservedQuery::compile(init.selector, options)?;
        Ok(Arc::new(Self {
            signature: init.signature,
            key: init.key,
            channel: init.channel,
            query,
            store: init.store,
            messenger: init.messenger,
            registry: init.registry,
            listeners: ListenerSet::new(),
            state: Mutex::new(ObserverState::new()),
        }))
    }

    /// Subscribe to the channel.
    pub(crate) fn initialize(self: &Arc<Self>) {
        self.state.lock().initialized = true;
        let sink: Arc<dyn NotificationSink> = Arc::clone(self) as Arc<dyn NotificationSink>;
        self.messenger.add_observer(&self.key, &self.channel, sink);
        tracing::debug!(key = %self.key, channel = %self.channel, "observer started");
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Registered with the messenger and not killed.
    pub fn is_alive(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Work waiting in the queue.
    pub fn queued(&self) -> usize {
        self.state.lock().message_queue.len()
    }

    /// Whether reconciliation re-reads the authoritative id set on every
    /// notification (sorted or limited queries).
    pub fn refreshes_authoritatively(&self) -> bool {
        self.query.needs_authoritative_refresh
    }

    /// Attach `listener`, replaying the current result set to it as `added`
    /// events.
    ///
    /// The first attach performs the initial fetch. A listener with no
    /// callbacks is ignored and yields `Ok(None)`. When another thread is
    /// mid-drain (or a callback attaches re-entrantly) the attach is queued
    /// behind pending notifications and runs on the draining thread.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> Result<Option<ListenerId>, StoreError> {
        if listener.is_empty() {
            return Ok(None);
        }
        let id = self.listeners.allocate_id();
        {
            let mut state = self.state.lock();
            if state.draining {
                state.message_queue.push_back(Pending::Attach(id, listener));
                return Ok(Some(id));
            }
            state.draining = true;
        }
        let attached = self.attach(id, listener);
        self.drain();
        attached.map(|()| Some(id))
    }

    /// Detach listener `id`. Returns `true` if it was attached or still
    /// queued for attachment.
    ///
    /// Teardown is left to the registry's reference count, so this is only
    /// reachable through [`ObserveHandle::stop`](crate::registry::ObserveHandle::stop).
    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        if self.listeners.remove(id) {
            return true;
        }
        let mut state = self.state.lock();
        let before = state.message_queue.len();
        state
            .message_queue
            .retain(|p| !matches!(p, Pending::Attach(queued, _) if *queued == id));
        state.message_queue.len() != before
    }

    /// Stop observing: unsubscribe from the channel and leave the registry.
    /// Idempotent.
    pub fn kill(&self) {
        {
            let mut state = self.state.lock();
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.message_queue.clear();
        }
        self.messenger.remove_observer(&self.key);
        if let Some(registry) = self.registry.upgrade() {
            registry.evict(&self.signature, self);
        }
        tracing::debug!(key = %self.key, "observer killed");
    }

    /// Queue incoming notifications instead of processing them.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Process everything queued, in order, then accept notifications
    /// directly again.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            if state.draining || state.message_queue.is_empty() {
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    /// Read-only view of the cached result set.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        Snapshot {
            observer: Arc::clone(self),
        }
    }

    fn attach(&self, id: ListenerId, listener: Arc<dyn Listener>) -> Result<(), StoreError> {
        let events = self
            .state
            .lock()
            .initial_fetch(&self.query, self.store.as_ref())?;
        self.listeners.insert(id, Arc::clone(&listener));
        tracing::trace!(key = %self.key, listener = id, initial = events.len(), "listener attached");
        for event in &events {
            event.deliver(listener.as_ref());
        }
        Ok(())
    }

    /// Run queued work until the queue is empty or the observer is paused.
    /// The caller must have set `draining`.
    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let next = if state.paused {
                    None
                } else {
                    state.message_queue.pop_front()
                };
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            match next {
                None => return,
                Some(Pending::Attach(id, listener)) => {
                    if let Err(e) = self.attach(id, listener) {
                        tracing::warn!(key = %self.key, listener = id, error = %e, "queued attach failed");
                        if let Some(registry) = self.registry.upgrade() {
                            registry.release(&self.signature, self);
                        }
                    }
                }
                Some(Pending::Message(msg)) => self.process(&msg),
            }
        }
    }

    fn process(&self, msg: &Notification) {
        let mut events: Vec<ObserverEvent> = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if !state.initialized {
                return;
            }
            state.reconcile(&self.query, self.store.as_ref(), msg, &mut events)
        };
        if let Err(e) = outcome {
            tracing::warn!(
                key = %self.key,
                method = ?msg.method,
                ts = msg.timestamp,
                error = %e,
                "notification abandoned after store error"
            );
        }
        self.listeners.dispatch(&events);
    }
}

impl NotificationSink for Observer {
    fn on_message(&self, notification: Notification) {
        {
            let mut state = self.state.lock();
            if !state.initialized || !state.initially_fetched {
                tracing::trace!(key = %self.key, "notification before initial fetch ignored");
                return;
            }
            state.message_queue.push_back(Pending::Message(notification));
            if state.paused || state.draining {
                return;
            }
            state.draining = true;
        }
        self.drain();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("key", &self.key)
            .field("channel", &self.channel)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Live, read-only view of an observer's cache.
///
/// Every call reads the current state; documents are returned as cached
/// (unprojected, with mixin fields and `_id`).
#[derive(Clone)]
pub struct Snapshot {
    observer: Arc<Observer>,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<Document> {
        self.observer.state.lock().cache.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.observer.state.lock().cache.contains_key(id)
    }

    /// Cached ids in ascending order.
    pub fn ids(&self) -> Vec<DocId> {
        self.observer.state.lock().cache.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.observer.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observer.state.lock().cache.is_empty()
    }

    pub fn documents(&self) -> BTreeMap<DocId, Document> {
        self.observer.state.lock().cache.clone()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("ids", &self.ids())
            .finish()
    }
}
