use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::types::FindOptions;

/// Name of the identity field every document carries.
pub const ID_FIELD: &str = "_id";

/// Document identifier as used for cache keys and listener callbacks.
pub type DocId = String;

/// A document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Top-level fields of a document, as delivered to `added` listeners.
pub type Fields = Map<String, Value>;

/// Read the id of `doc` as a [`DocId`].
///
/// Only string ids identify a document. Point lookups are rebuilt from the
/// cache key as `{ "_id": "<key>" }`, which a numeric `_id` would never
/// match, so documents with any other `_id` are treated as unidentified.
pub fn doc_id(doc: &Document) -> Option<DocId> {
    doc.get(ID_FIELD)?.as_str().map(str::to_string)
}

/// `{ "_id": id }`
pub fn id_selector(id: &str) -> Value {
    let mut obj = Map::new();
    obj.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(obj)
}

/// `selector ∧ { "_id": id }` — a selector scoped down to a single document.
///
/// An existing `_id` condition is kept under `$and` so both must hold.
pub fn scoped_selector(selector: &Value, id: &str) -> Value {
    match selector.as_object() {
        Some(obj) if obj.is_empty() => id_selector(id),
        Some(obj) if !obj.contains_key(ID_FIELD) => {
            let mut scoped = obj.clone();
            scoped.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            Value::Object(scoped)
        }
        Some(_) => {
            let mut obj = Map::new();
            obj.insert(
                "$and".to_string(),
                Value::Array(vec![selector.clone(), id_selector(id)]),
            );
            Value::Object(obj)
        }
        None => id_selector(id),
    }
}

/// Rewrite shorthand selectors into their object form.
///
/// - `null` → `{}` (match everything)
/// - bare string or number → `{ "_id": value }`
/// - objects pass through untouched
pub fn normalize_selector(selector: Value) -> Value {
    match selector {
        Value::Null => Value::Object(Map::new()),
        v @ (Value::String(_) | Value::Number(_)) => {
            let mut obj = Map::new();
            obj.insert(ID_FIELD.to_string(), v);
            Value::Object(obj)
        }
        other => other,
    }
}

// ============================================================================
// ObserveOptions
// ============================================================================

/// Everything that defines one observed query.
///
/// Deserializable so subscriptions can be described in configuration files or
/// on the wire:
///
/// ```json
/// { "selector": { "owner": "u1" },
///   "options": { "sort": [{ "field": "rank", "direction": "asc" }], "limit": 10 },
///   "mixinFields": { "kind": "task" },
///   "channel": "tasks::u1" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObserveOptions {
    pub selector: Value,
    pub options: FindOptions,
    /// Static fields merged into every cached document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixin_fields: Option<Map<String, Value>>,
    /// Channel to listen on. Defaults to the store name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Skip the authoritative id refresh even when the cursor has a limit or
    /// sort; membership is then decided by the matcher alone.
    pub lazy_limit: bool,
    /// Never query the store for the initial result set; the cache is built
    /// purely from notifications.
    pub without_store: bool,
}

impl ObserveOptions {
    pub fn new(selector: Value) -> Self {
        Self {
            selector,
            ..Default::default()
        }
    }

    pub fn fields(mut self, fields: Map<String, Value>) -> Self {
        self.options.fields = fields;
        self
    }

    pub fn sort(mut self, sort: Vec<crate::query::types::SortEntry>) -> Self {
        self.options.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn mixin_fields(mut self, mixin: Map<String, Value>) -> Self {
        self.mixin_fields = Some(mixin);
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn lazy_limit(mut self, lazy: bool) -> Self {
        self.lazy_limit = lazy;
        self
    }

    pub fn without_store(mut self, without: bool) -> Self {
        self.without_store = without;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
