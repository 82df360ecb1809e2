//! Reconciliation: deciding, per notification, what the cache should hold and
//! which events that implies.
//!
//! Everything here runs with the observer's state lock held and never calls a
//! listener; events are collected and dispatched by the caller.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::diff::{changed_fields, ChangedFields};
use crate::error::{ConfigError, StoreError};
use crate::modifier::{apply_modifier, targeted_fields};
use crate::notification::{Method, Notification};
use crate::projection::Projection;
use crate::query::operators::Matcher;
use crate::query::types::FindOptions;
use crate::store::DocumentStore;
use crate::types::{
    doc_id, id_selector, normalize_selector, scoped_selector, DocId, Document, Fields, ObserveOptions,
    ID_FIELD,
};

use super::listener::{Listener, ListenerId, ObserverEvent};

// ============================================================================
// ObservedQuery — immutable per-observer configuration
// ============================================================================

/// The compiled, immutable half of an observer.
pub(crate) struct ObservedQuery {
    pub selector: Value,
    /// Cursor used for the initial fetch: the caller's options with the
    /// projection widened by mixin and selector fields.
    pub find_options: FindOptions,
    /// Projection only, for point lookups of a single id.
    pub point_options: FindOptions,
    /// What listeners see.
    pub projection: Projection,
    pub matcher: Option<Matcher>,
    pub mixin: Option<Map<String, Value>>,
    pub needs_authoritative_refresh: bool,
    pub without_store: bool,
}

impl ObservedQuery {
    pub fn compile(selector: Value, options: &ObserveOptions) -> Result<Self, ConfigError> {
        let projection = Projection::compile(&options.options.fields)?;
        if !projection.includes_id() {
            return Err(ConfigError::IdExcluded);
        }

        let mixin = options.mixin_fields.clone().filter(|m| !m.is_empty());
        let projection = match &mixin {
            Some(m) => projection.with_mixin(m),
            None => projection,
        };

        let matcher = match Matcher::compile(&selector) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(error = %e, "selector has no local matcher; relevance falls back to the store");
                None
            }
        };

        let fetch_projection = match &matcher {
            Some(m) => projection.widen(m.referenced_fields().iter().map(String::as_str)),
            None => projection.clone(),
        };
        let find_options = FindOptions {
            fields: fetch_projection.to_spec(),
            ..options.options.clone()
        };
        let point_options = find_options.unpaginated();

        Ok(Self {
            selector,
            point_options,
            needs_authoritative_refresh: options.options.is_ordering_dependent()
                && !options.lazy_limit,
            find_options,
            projection,
            matcher,
            mixin,
            without_store: options.without_store,
        })
    }

    /// Listener payload for a whole document.
    pub fn project(&self, doc: &Document) -> Fields {
        let mut fields = self.projection.apply(doc);
        fields.remove(ID_FIELD);
        fields
    }

    /// Listener payload for a set of changes.
    pub fn project_changes(&self, changes: &ChangedFields) -> ChangedFields {
        let mut fields = self.projection.apply_changes(changes);
        fields.remove(ID_FIELD);
        fields
    }

    /// Merge mixin fields into `doc`, except those `modifier` writes itself.
    pub fn merge_mixin(&self, doc: &mut Document, modifier: Option<&Value>) {
        let Some(mixin) = &self.mixin else {
            return;
        };
        let skip = modifier.and_then(targeted_fields).unwrap_or_default();
        for (key, value) in mixin {
            if !skip.contains(key) {
                doc.insert(key.clone(), value.clone());
            }
        }
    }

    /// Selector check for a resolved document, asking the store when there
    /// is no local matcher.
    fn matches(&self, store: &dyn DocumentStore, doc: &Document, id: &str) -> Result<bool, StoreError> {
        match &self.matcher {
            Some(matcher) => Ok(matcher.matches(doc)),
            None => Ok(store.count(&scoped_selector(&self.selector, id))? > 0),
        }
    }
}

// ============================================================================
// ObserverState — the mutable half
// ============================================================================

/// Timestamp and method of the last notification accepted for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSeen {
    pub timestamp: u64,
    pub method: Method,
}

/// Work queued while the observer is paused or another thread is draining.
pub(crate) enum Pending {
    Message(Notification),
    Attach(ListenerId, Arc<dyn Listener>),
}

pub(crate) struct ObserverState {
    pub cache: BTreeMap<DocId, Document>,
    pub last_seen: HashMap<DocId, LastSeen>,
    pub message_queue: VecDeque<Pending>,
    /// Registered with the messenger and not yet killed.
    pub initialized: bool,
    pub initially_fetched: bool,
    pub paused: bool,
    /// Some thread is running the drain loop.
    pub draining: bool,
}

/// A stale notification that would run the lifecycle backwards: resurrecting
/// a removed document, or erasing one whose creation was already seen.
fn contradicts(last: Method, incoming: Method) -> bool {
    (incoming != Method::Remove && last == Method::Remove)
        || (incoming == Method::Remove && last.is_creation())
}

impl ObserverState {
    pub fn new() -> Self {
        Self {
            cache: BTreeMap::new(),
            last_seen: HashMap::new(),
            message_queue: VecDeque::new(),
            initialized: false,
            initially_fetched: false,
            paused: false,
            draining: false,
        }
    }

    /// Populate the cache from the store (once) and return the `added`
    /// events a newly attached listener should receive.
    pub fn initial_fetch(
        &mut self,
        query: &ObservedQuery,
        store: &dyn DocumentStore,
    ) -> Result<Vec<ObserverEvent>, StoreError> {
        if !self.initially_fetched {
            if !query.without_store {
                for mut doc in store.find(&query.selector, &query.find_options)? {
                    let Some(id) = doc_id(&doc) else {
                        tracing::debug!("fetched document without a string _id skipped");
                        continue;
                    };
                    query.merge_mixin(&mut doc, None);
                    self.cache.insert(id, doc);
                }
            }
            self.initially_fetched = true;
        }
        Ok(self
            .cache
            .iter()
            .map(|(id, doc)| ObserverEvent::Added {
                id: id.clone(),
                fields: query.project(doc),
            })
            .collect())
    }

    /// Run one notification through the cache, appending resulting events.
    ///
    /// On a store error the events produced so far are kept; the rest of the
    /// notification is abandoned.
    pub fn reconcile(
        &mut self,
        query: &ObservedQuery,
        store: &dyn DocumentStore,
        msg: &Notification,
        events: &mut Vec<ObserverEvent>,
    ) -> Result<(), StoreError> {
        let ids = self.target_ids(msg);
        if ids.is_empty() {
            tracing::trace!(method = ?msg.method, "notification resolves to no ids");
            return Ok(());
        }

        let right_ids: Option<Vec<DocId>> = if query.needs_authoritative_refresh {
            Some(store.find_ids(&query.selector, &query.find_options)?)
        } else {
            None
        };
        let right_set: Option<HashSet<&str>> = right_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        for id in &ids {
            self.reconcile_id(query, store, msg, id, right_set.as_ref(), events)?;
        }

        if let Some(right_ids) = &right_ids {
            self.reconcile_membership(query, store, right_ids, events)?;
        }
        Ok(())
    }

    fn target_ids(&self, msg: &Notification) -> Vec<DocId> {
        if let Some(ids) = &msg.ids {
            return ids.clone().into_vec();
        }
        if !msg.disconnected_from_store {
            return Vec::new();
        }
        let Some(selector) = &msg.selector else {
            return Vec::new();
        };
        match Matcher::compile(&normalize_selector(selector.clone())) {
            Ok(matcher) => self
                .cache
                .iter()
                .filter(|(_, doc)| matcher.matches(doc))
                .map(|(id, _)| id.clone())
                .collect(),
            Err(e) => {
                tracing::trace!(error = %e, "cannot derive ids from notification selector");
                Vec::new()
            }
        }
    }

    fn reconcile_id(
        &mut self,
        query: &ObservedQuery,
        store: &dyn DocumentStore,
        msg: &Notification,
        id: &str,
        right_ids: Option<&HashSet<&str>>,
        events: &mut Vec<ObserverEvent>,
    ) -> Result<(), StoreError> {
        let method = msg.method;
        let last = self.last_seen.get(id).copied();
        let stale = last.is_some_and(|l| msg.timestamp <= l.timestamp);

        if let Some(last) = last.filter(|_| stale) {
            if contradicts(last.method, method) {
                tracing::trace!(id, ?method, last = ?last.method, ts = msg.timestamp, "stale notification dropped");
                return Ok(());
            }
        }

        let old = self.cache.get(id).cloned();
        let in_scope = right_ids.map_or(true, |r| r.contains(id));

        let mut resolved: Option<Document> = msg.doc.clone().map(|mut doc| {
            doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            doc
        });

        if resolved.is_none() {
            if method == Method::Insert && !stale {
                resolved = msg.selector.as_ref().and_then(Value::as_object).map(|fields| {
                    let mut doc = fields.clone();
                    doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                    doc
                });
            } else if msg.disconnected_from_store && method != Method::Remove {
                let mut doc = Document::new();
                doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                if let Some(old) = &old {
                    doc.extend(old.clone());
                }
                resolved = modified(doc, msg.modifier.as_ref());
            }
        }

        if resolved.is_none() && method.is_update() && in_scope && !stale {
            if let Some(old) = &old {
                resolved = modified(old.clone(), msg.modifier.as_ref());
            }
        }

        let fetched = resolved.is_none() && in_scope && method != Method::Remove;
        if fetched {
            resolved = store.find_one(&scoped_selector(&query.selector, id), &query.point_options)?;
        }

        let relevant = match &resolved {
            Some(doc) if in_scope => {
                msg.disconnected_from_store
                    || fetched
                    || right_ids.is_some_and(|r| r.contains(id))
                    || query.matches(store, doc, id)?
            }
            _ => false,
        };

        match resolved {
            Some(mut doc) if relevant && method != Method::Remove => {
                query.merge_mixin(&mut doc, msg.modifier.as_ref());
                match &old {
                    Some(old) => {
                        let fields = query.project_changes(&changed_fields(&doc, old));
                        self.cache.insert(id.to_string(), doc);
                        if !fields.is_empty() {
                            tracing::trace!(id, "changed");
                            events.push(ObserverEvent::Changed {
                                id: id.to_string(),
                                fields,
                            });
                        }
                    }
                    None => {
                        let fields = query.project(&doc);
                        self.cache.insert(id.to_string(), doc);
                        tracing::trace!(id, "added");
                        events.push(ObserverEvent::Added {
                            id: id.to_string(),
                            fields,
                        });
                    }
                }
            }
            _ if old.is_some() => {
                self.cache.remove(id);
                tracing::trace!(id, "removed");
                events.push(ObserverEvent::Removed { id: id.to_string() });
            }
            _ => {}
        }

        if !stale {
            self.last_seen.insert(
                id.to_string(),
                LastSeen {
                    timestamp: msg.timestamp,
                    method,
                },
            );
        }
        Ok(())
    }

    /// Bring the cached id set in line with the authoritative one.
    fn reconcile_membership(
        &mut self,
        query: &ObservedQuery,
        store: &dyn DocumentStore,
        right_ids: &[DocId],
        events: &mut Vec<ObserverEvent>,
    ) -> Result<(), StoreError> {
        let right: HashSet<&str> = right_ids.iter().map(String::as_str).collect();

        let evicted: Vec<DocId> = self
            .cache
            .keys()
            .filter(|id| !right.contains(id.as_str()))
            .cloned()
            .collect();
        for id in evicted {
            self.cache.remove(&id);
            tracing::trace!(id = %id, "removed by authoritative refresh");
            events.push(ObserverEvent::Removed { id });
        }

        for id in right_ids {
            if self.cache.contains_key(id) {
                continue;
            }
            let Some(mut doc) = store.find_one(&id_selector(id), &query.point_options)? else {
                continue;
            };
            query.merge_mixin(&mut doc, None);
            let fields = query.project(&doc);
            self.cache.insert(id.clone(), doc);
            tracing::trace!(id = %id, "added by authoritative refresh");
            events.push(ObserverEvent::Added {
                id: id.clone(),
                fields,
            });
        }
        Ok(())
    }
}

/// `doc` with `modifier` applied, or `None` if there is no modifier or it
/// cannot be applied locally.
fn modified(mut doc: Document, modifier: Option<&Value>) -> Option<Document> {
    let modifier = modifier?;
    match apply_modifier(&mut doc, modifier) {
        Ok(()) => Some(doc),
        Err(e) => {
            tracing::trace!(error = %e, "modifier not applicable locally");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
