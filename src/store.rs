//! Backing document store.
//!
//! [`DocumentStore`] is the narrow read interface an observer needs: cursor
//! fetch, point fetch, id-only fetch, and existence count. [`MemoryStore`] is
//! an in-process implementation used by tests and embedded setups.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{ModifierError, StoreError};
use crate::modifier::apply_modifier;
use crate::projection::Projection;
use crate::query::execute::execute_find;
use crate::query::operators::Matcher;
use crate::query::types::FindOptions;
use crate::types::{doc_id, DocId, Document, ID_FIELD};

/// Read access to the authoritative document store.
///
/// Implementors must be `Send + Sync` so observers can be shared across
/// threads. Only [`find`](DocumentStore::find) is required; the other
/// operations have defaults built on it that backends may override with
/// cheaper native queries.
pub trait DocumentStore: Send + Sync {
    /// Collection / table name. Part of every query signature and the default
    /// notification channel.
    fn name(&self) -> &str;

    /// All documents matching `selector`, shaped by `options`.
    fn find(&self, selector: &Value, options: &FindOptions) -> Result<Vec<Document>, StoreError>;

    /// First document matching `selector`, or `None`.
    fn find_one(
        &self,
        selector: &Value,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        let limited = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(selector, &limited)?.into_iter().next())
    }

    /// Ids of the documents `find` would return, in cursor order.
    fn find_ids(&self, selector: &Value, options: &FindOptions) -> Result<Vec<DocId>, StoreError> {
        Ok(self
            .find(selector, &options.ids_only())?
            .iter()
            .filter_map(doc_id)
            .collect())
    }

    /// Number of documents matching `selector`, ignoring pagination.
    fn count(&self, selector: &Value) -> Result<usize, StoreError> {
        Ok(self
            .find(selector, &FindOptions::default().ids_only())?
            .len())
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// Per-operation call counters, handy for asserting round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub finds: usize,
    pub find_ones: usize,
    pub find_ids: usize,
    pub counts: usize,
}

/// In-memory [`DocumentStore`] keyed by `_id`.
pub struct MemoryStore {
    name: String,
    docs: RwLock<BTreeMap<DocId, Document>>,
    available: AtomicBool,
    finds: AtomicUsize,
    find_ones: AtomicUsize,
    find_ids: AtomicUsize,
    counts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            finds: AtomicUsize::new(0),
            find_ones: AtomicUsize::new(0),
            find_ids: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
        }
    }

    /// Seed the store with `docs`. Documents without a string `_id` are
    /// skipped.
    pub fn with_docs(name: impl Into<String>, docs: impl IntoIterator<Item = Document>) -> Self {
        let store = Self::new(name);
        {
            let mut guard = store.docs.write();
            for doc in docs {
                if let Some(id) = doc_id(&doc) {
                    guard.insert(id, doc);
                }
            }
        }
        store
    }

    /// Simulate the backend going away (every read fails) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            finds: self.finds.load(Ordering::SeqCst),
            find_ones: self.find_ones.load(Ordering::SeqCst),
            find_ids: self.find_ids.load(Ordering::SeqCst),
            counts: self.counts.load(Ordering::SeqCst),
        }
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Insert or replace a document. Returns its id, or `None` (and stores
    /// nothing) if it has no string `_id`.
    pub fn put(&self, doc: Document) -> Option<DocId> {
        let Some(id) = doc_id(&doc) else {
            tracing::debug!(store = %self.name, "document without a string _id rejected");
            return None;
        };
        self.docs.write().insert(id.clone(), doc);
        Some(id)
    }

    /// Apply `modifier` to document `id`. Returns `Ok(false)` if absent.
    pub fn update(&self, id: &str, modifier: &Value) -> Result<bool, ModifierError> {
        let mut docs = self.docs.write();
        match docs.get_mut(id) {
            Some(doc) => {
                apply_modifier(doc, modifier)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply `modifier` to document `id`, creating `{_id: id}` first if absent.
    pub fn upsert(&self, id: &str, modifier: &Value) -> Result<(), ModifierError> {
        let mut docs = self.docs.write();
        let mut doc = docs.get(id).cloned().unwrap_or_else(|| {
            let mut fresh = Document::new();
            fresh.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            fresh
        });
        apply_modifier(&mut doc, modifier)?;
        docs.insert(id.to_string(), doc);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.docs.write().remove(id).is_some()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                store: self.name.clone(),
                message: "store marked unavailable".to_string(),
            })
        }
    }

    fn run(&self, selector: &Value, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        let matcher = Matcher::compile(selector).map_err(|source| StoreError::Query {
            store: self.name.clone(),
            source,
        })?;
        let projection = Projection::compile(&options.fields)
            .map_err(|e| StoreError::Backend(Box::new(e)))?;
        let snapshot: Vec<Document> = self.docs.read().values().cloned().collect();
        Ok(execute_find(snapshot, &matcher, options)
            .iter()
            .map(|doc| projection.apply(doc))
            .collect())
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, selector: &Value, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.run(selector, options)
    }

    fn find_one(
        &self,
        selector: &Value,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        self.find_ones.fetch_add(1, Ordering::SeqCst);
        let limited = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.run(selector, &limited)?.into_iter().next())
    }

    fn find_ids(&self, selector: &Value, options: &FindOptions) -> Result<Vec<DocId>, StoreError> {
        self.find_ids.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .run(selector, &options.ids_only())?
            .iter()
            .filter_map(doc_id)
            .collect())
    }

    fn count(&self, selector: &Value) -> Result<usize, StoreError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.run(selector, &FindOptions::default().ids_only())?.len())
    }
}

// ============================================================================
// Tests
// ============================================================================
