//! In-memory cursor execution — filter, sort, skip, limit.

use std::cmp::Ordering;

use serde_json::Value;

use crate::types::Document;

use super::operators::{compare_values, get_document_field, Matcher};
use super::types::{FindOptions, SortDirection, SortEntry};

// ============================================================================
// Sorting
// ============================================================================

/// Sort documents by multiple fields with cascading priority.
///
/// The sort is stable, so documents that compare equal keep their input order.
pub fn sort_documents(mut docs: Vec<Document>, sort: &[SortEntry]) -> Vec<Document> {
    if sort.is_empty() {
        return docs;
    }

    docs.sort_by(|a, b| {
        for entry in sort {
            let va = get_document_field(a, &entry.field).unwrap_or(&Value::Null);
            let vb = get_document_field(b, &entry.field).unwrap_or(&Value::Null);
            let cmp = compare_values(va, vb);
            if cmp != Ordering::Equal {
                return if entry.direction == SortDirection::Desc {
                    cmp.reverse()
                } else {
                    cmp
                };
            }
        }
        Ordering::Equal
    });

    docs
}

// ============================================================================
// Pagination
// ============================================================================

/// Apply skip then limit.
pub fn paginate_documents(
    docs: Vec<Document>,
    skip: Option<usize>,
    limit: Option<usize>,
) -> Vec<Document> {
    let iter = docs.into_iter().skip(skip.unwrap_or(0));
    match limit {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run a cursor over `docs`:
///
/// 1. Filter with `matcher`.
/// 2. Sort (if requested).
/// 3. Skip, then limit.
///
/// Projection is left to the caller.
pub fn execute_find(docs: Vec<Document>, matcher: &Matcher, options: &FindOptions) -> Vec<Document> {
    let filtered: Vec<Document> = docs.into_iter().filter(|d| matcher.matches(d)).collect();

    let sorted = match &options.sort {
        Some(entries) => sort_documents(filtered, entries),
        None => filtered,
    };

    paginate_documents(sorted, options.skip, options.limit)
}

// ============================================================================
// Tests
// ============================================================================
