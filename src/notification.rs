//! Mutation notifications — the messages an observer consumes.
//!
//! The wire form is JSON. Both the compact field names used by publishers
//! (`id`, `ts`, `withoutMongo`) and the long names are accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::types::{DocId, Document};

/// The store write a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Insert,
    Update,
    Upsert,
    Remove,
}

impl Method {
    /// Insert-like writes: they bring a document into existence.
    pub fn is_creation(self) -> bool {
        matches!(self, Method::Insert | Method::Upsert)
    }

    pub fn is_update(self) -> bool {
        matches!(self, Method::Update | Method::Upsert)
    }
}

/// One id or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ids {
    One(DocId),
    Many(Vec<DocId>),
}

impl Ids {
    pub fn into_vec(self) -> Vec<DocId> {
        match self {
            Ids::One(id) => vec![id],
            Ids::Many(ids) => ids,
        }
    }
}

impl From<&str> for Ids {
    fn from(id: &str) -> Self {
        Ids::One(id.to_string())
    }
}

impl From<Vec<DocId>> for Ids {
    fn from(ids: Vec<DocId>) -> Self {
        Ids::Many(ids)
    }
}

/// A store write as announced on a channel.
///
/// Notifications may carry only partial information: a `modifier` and/or a
/// `selector` instead of a full `doc`. `disconnected_from_store` tells the
/// observer the sender never saw the resolved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub ids: Option<Ids>,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,
    #[serde(alias = "ts")]
    pub timestamp: u64,
    #[serde(default, alias = "withoutMongo")]
    pub disconnected_from_store: bool,
}

impl Notification {
    fn new(method: Method, timestamp: u64) -> Self {
        Self {
            ids: None,
            method,
            doc: None,
            modifier: None,
            selector: None,
            timestamp,
            disconnected_from_store: false,
        }
    }

    /// An insert whose field values are exactly `selector`.
    pub fn insert(id: &str, selector: Value, timestamp: u64) -> Self {
        Self {
            ids: Some(id.into()),
            selector: Some(selector),
            ..Self::new(Method::Insert, timestamp)
        }
    }

    pub fn update(ids: impl Into<Ids>, modifier: Value, timestamp: u64) -> Self {
        Self {
            ids: Some(ids.into()),
            modifier: Some(modifier),
            ..Self::new(Method::Update, timestamp)
        }
    }

    pub fn upsert(ids: impl Into<Ids>, modifier: Value, timestamp: u64) -> Self {
        Self {
            ids: Some(ids.into()),
            modifier: Some(modifier),
            ..Self::new(Method::Upsert, timestamp)
        }
    }

    pub fn remove(ids: impl Into<Ids>, timestamp: u64) -> Self {
        Self {
            ids: Some(ids.into()),
            ..Self::new(Method::Remove, timestamp)
        }
    }

    /// A write addressed by selector rather than by id.
    pub fn by_selector(method: Method, selector: Value, modifier: Option<Value>, timestamp: u64) -> Self {
        Self {
            selector: Some(selector),
            modifier,
            ..Self::new(method, timestamp)
        }
    }

    pub fn with_doc(mut self, doc: Document) -> Self {
        self.doc = Some(doc);
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.disconnected_from_store = true;
        self
    }

    /// Decode a wire payload received on `channel`.
    pub fn decode(channel: &str, payload: &str) -> Result<Self, CodecError> {
        serde_json::from_str(payload).map_err(|source| CodecError {
            channel: channel.to_string(),
            source,
        })
    }

    pub fn encode(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
