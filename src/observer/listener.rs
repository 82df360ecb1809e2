//! Listener callbacks and the per-observer fan-out set.
//!
//! Each dispatch works on a copy of the attached listeners taken when it
//! starts. Detaching during a dispatch therefore does not cut that dispatch
//! short, and a listener attached mid-dispatch first hears the next one.
//! A panicking callback is contained to the listener that raised it.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::diff::ChangedFields;
use crate::types::{DocId, Fields};

/// Identifier of one attached listener, unique per observer.
pub type ListenerId = u64;

/// Receives the three notification kinds of an observed query.
///
/// Every method has a no-op default, so implementors only override what they
/// need.
pub trait Listener: Send + Sync {
    /// `id` entered the result set with `fields` (projected, without `_id`).
    fn on_added(&self, _id: &str, _fields: &Fields) {}

    /// `id` changed; `fields` holds only the changed top-level fields, `None`
    /// marking removed ones.
    fn on_changed(&self, _id: &str, _fields: &ChangedFields) {}

    /// `id` left the result set.
    fn on_removed(&self, _id: &str) {}

    /// A listener that wants no callbacks at all is never attached.
    fn is_empty(&self) -> bool {
        false
    }
}

type AddedFn = dyn Fn(&str, &Fields) + Send + Sync;
type ChangedFn = dyn Fn(&str, &ChangedFields) + Send + Sync;
type RemovedFn = dyn Fn(&str) + Send + Sync;

/// Closure-based [`Listener`]: any subset of the three callbacks.
#[derive(Default, Clone)]
pub struct Callbacks {
    added: Option<Arc<AddedFn>>,
    changed: Option<Arc<ChangedFn>>,
    removed: Option<Arc<RemovedFn>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(mut self, f: impl Fn(&str, &Fields) + Send + Sync + 'static) -> Self {
        self.added = Some(Arc::new(f));
        self
    }

    pub fn changed(mut self, f: impl Fn(&str, &ChangedFields) + Send + Sync + 'static) -> Self {
        self.changed = Some(Arc::new(f));
        self
    }

    pub fn removed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.removed = Some(Arc::new(f));
        self
    }
}

impl Listener for Callbacks {
    fn on_added(&self, id: &str, fields: &Fields) {
        if let Some(f) = &self.added {
            f(id, fields);
        }
    }

    fn on_changed(&self, id: &str, fields: &ChangedFields) {
        if let Some(f) = &self.changed {
            f(id, fields);
        }
    }

    fn on_removed(&self, id: &str) {
        if let Some(f) = &self.removed {
            f(id);
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_none() && self.changed.is_none() && self.removed.is_none()
    }
}

// ============================================================================
// Events
// ============================================================================

/// One notification to fan out to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Added { id: DocId, fields: Fields },
    Changed { id: DocId, fields: ChangedFields },
    Removed { id: DocId },
}

impl ObserverEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id } => id,
        }
    }

    /// Deliver to one listener, isolating panics.
    pub(crate) fn deliver(&self, listener: &dyn Listener) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            Self::Added { id, fields } => listener.on_added(id, fields),
            Self::Changed { id, fields } => listener.on_changed(id, fields),
            Self::Removed { id } => listener.on_removed(id),
        }));
        if outcome.is_err() {
            match self {
                // The listener may already have torn the document down.
                Self::Removed { id } => tracing::trace!(id = %id, "removed callback panicked; ignored"),
                other => tracing::warn!(id = %other.id(), "listener callback panicked"),
            }
        }
    }
}

// ============================================================================
// ListenerSet
// ============================================================================

/// The set of listeners attached to one observer.
///
/// All methods take `&self`; the internal `parking_lot::Mutex` is never held
/// while callbacks run, so listeners may detach themselves mid-dispatch.
pub struct ListenerSet {
    listeners: Mutex<BTreeMap<ListenerId, Arc<dyn Listener>>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve an id for a listener that will be attached later.
    pub fn allocate_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, id: ListenerId, listener: Arc<dyn Listener>) {
        self.listeners.lock().insert(id, listener);
    }

    /// Detach `id`. Returns `true` if it was attached.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Deliver `events`, in order, to every listener attached when the
    /// dispatch starts.
    pub fn dispatch(&self, events: &[ObserverEvent]) {
        if events.is_empty() {
            return;
        }
        let snapshot: Vec<Arc<dyn Listener>> = self.listeners.lock().values().cloned().collect();
        for event in events {
            for listener in &snapshot {
                event.deliver(listener.as_ref());
            }
        }
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
