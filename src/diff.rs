use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::Document;

/// Top-level field changes between two versions of a document.
///
/// `Some(value)` is the new value of an added or updated field; `None` marks
/// a field that was removed.
pub type ChangedFields = BTreeMap<String, Option<Value>>;

// ============================================================================
// Public API
// ============================================================================

/// Compute the minimal set of top-level field changes turning `old` into `new`.
///
/// Nested objects are compared as a whole: any difference inside `a` reports
/// all of `a` as changed.
pub fn changed_fields(new: &Document, old: &Document) -> ChangedFields {
    let mut changes = ChangedFields::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            _ => {
                changes.insert(key.clone(), Some(new_value.clone()));
            }
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }

    changes
}

/// Apply `changes` to `doc` in place (the inverse of [`changed_fields`]).
pub fn apply_changes(doc: &mut Document, changes: &ChangedFields) {
    for (key, change) in changes {
        match change {
            Some(value) => {
                doc.insert(key.clone(), value.clone());
            }
            None => {
                doc.remove(key);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
