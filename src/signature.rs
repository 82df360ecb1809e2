//! Canonical query signatures.
//!
//! Two subscriptions with equal signatures share one observer. The signature
//! is a JSON rendering of the normalized query; `serde_json` objects keep
//! their keys sorted, so key order in the caller's input does not matter.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::query::types::FindOptions;
use crate::types::{normalize_selector, ObserveOptions};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureParts<'a> {
    store: &'a str,
    channel: &'a str,
    selector: &'a Value,
    options: &'a FindOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    mixin_fields: Option<&'a Map<String, Value>>,
    lazy_limit: bool,
    without_store: bool,
}

/// Canonical key identifying one logical query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    /// Build the signature for `options` observed on `store`.
    ///
    /// Returns the signature together with the normalized selector and the
    /// resolved channel name so callers don't normalize twice.
    pub fn compute(store: &str, options: &ObserveOptions) -> (Self, Value, String) {
        let selector = normalize_selector(options.selector.clone());
        let channel = options
            .channel
            .clone()
            .unwrap_or_else(|| store.to_string());
        let parts = SignatureParts {
            store,
            channel: &channel,
            selector: &selector,
            options: &options.options,
            mixin_fields: options.mixin_fields.as_ref().filter(|m| !m.is_empty()),
            lazy_limit: options.lazy_limit,
            without_store: options.without_store,
        };
        // Plain JSON data with string keys always serializes.
        let key = serde_json::to_string(&parts).unwrap_or_default();
        (Self(key), selector, channel)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
