//! Query type definitions: sort and find options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Sort Types
// ============================================================================

/// Sort direction for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A sort specification for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortEntry {
    pub field: String,
    pub direction: SortDirection,
}

impl SortEntry {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

// ============================================================================
// Find Options
// ============================================================================

/// Cursor options passed to the backing store: projection, sort, pagination.
///
/// `fields` is a Mongo-style projection spec (`{ "name": 1 }` or
/// `{ "secret": 0 }`); an empty map selects every field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl FindOptions {
    /// `true` when result membership depends on ordering: a single point
    /// mutation can push another document in or out of the window.
    pub fn is_ordering_dependent(&self) -> bool {
        self.limit.is_some() || self.sort.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Same cursor, projected down to the id field only.
    pub fn ids_only(&self) -> Self {
        let mut fields = Map::new();
        fields.insert(crate::types::ID_FIELD.to_string(), Value::from(1));
        Self {
            fields,
            sort: self.sort.clone(),
            limit: self.limit,
            skip: self.skip,
        }
    }

    /// Same projection, without sort or pagination.
    pub fn unpaginated(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
