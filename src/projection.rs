//! Projection compiler: turns a `{ field: 0|1 }` spec into a document filter.
//!
//! Specs are either purely inclusive or purely exclusive; `_id` is the one
//! field that may be toggled independently. Dotted paths (`"a.b"`) select
//! nested fields.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::diff::ChangedFields;
use crate::error::ConfigError;
use crate::types::{Document, ID_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Leaf,
    Branch(BTreeMap<String, Node>),
}

/// A compiled projection. Pure: applying it never mutates its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    mode: Mode,
    tree: BTreeMap<String, Node>,
    include_id: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            mode: Mode::All,
            tree: BTreeMap::new(),
            include_id: true,
        }
    }
}

fn rule_is_truthy(field: &str, rule: &Value) -> Result<bool, ConfigError> {
    match rule {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        other => Err(ConfigError::InvalidProjection {
            field: field.to_string(),
            reason: format!("unsupported projection value {other}"),
        }),
    }
}

fn insert_path(tree: &mut BTreeMap<String, Node>, path: &str) {
    match path.split_once('.') {
        None => {
            tree.insert(path.to_string(), Node::Leaf);
        }
        Some((head, rest)) => {
            let node = tree
                .entry(head.to_string())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            // A whole-field rule already covers every sub-path.
            if let Node::Branch(children) = node {
                insert_path(children, rest);
            }
        }
    }
}

fn flatten(tree: &BTreeMap<String, Node>, prefix: &str, out: &mut Vec<String>) {
    for (key, node) in tree {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match node {
            Node::Leaf => out.push(path),
            Node::Branch(children) => flatten(children, &path, out),
        }
    }
}

fn include_value(node: &Node, value: &Value) -> Option<Value> {
    match (node, value) {
        (Node::Leaf, v) => Some(v.clone()),
        (Node::Branch(children), Value::Object(obj)) => {
            Some(Value::Object(include_object(children, obj)))
        }
        (Node::Branch(children), Value::Array(items)) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| item.as_object())
                .map(|obj| Value::Object(include_object(children, obj)))
                .collect(),
        )),
        (Node::Branch(_), _) => None,
    }
}

fn include_object(tree: &BTreeMap<String, Node>, obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, node) in tree {
        if let Some(projected) = obj.get(key).and_then(|v| include_value(node, v)) {
            out.insert(key.clone(), projected);
        }
    }
    out
}

fn exclude_value(children: &BTreeMap<String, Node>, value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(exclude_object(children, obj)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| exclude_value(children, item))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn exclude_object(tree: &BTreeMap<String, Node>, obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in obj {
        match tree.get(key) {
            Some(Node::Leaf) => {}
            Some(Node::Branch(children)) => {
                out.insert(key.clone(), exclude_value(children, value));
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

impl Projection {
    /// Compile a projection spec.
    ///
    /// An empty spec selects every field. Mixing inclusion and exclusion for
    /// fields other than `_id` is a [`ConfigError::MixedProjection`].
    pub fn compile(spec: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut including: Option<bool> = None;
        let mut include_id = true;
        let mut tree = BTreeMap::new();

        for (field, rule) in spec {
            let truthy = rule_is_truthy(field, rule)?;
            if field == ID_FIELD {
                include_id = truthy;
                continue;
            }
            match including {
                None => including = Some(truthy),
                Some(mode) if mode != truthy => {
                    return Err(ConfigError::MixedProjection {
                        field: field.clone(),
                    })
                }
                Some(_) => {}
            }
            insert_path(&mut tree, field);
        }

        let mode = match including {
            None => Mode::All,
            Some(true) => Mode::Include,
            Some(false) => Mode::Exclude,
        };
        Ok(Self {
            mode,
            tree,
            include_id,
        })
    }

    pub fn includes_id(&self) -> bool {
        self.include_id
    }

    /// Whether the projection keeps every field.
    pub fn is_identity(&self) -> bool {
        self.mode == Mode::All && self.include_id
    }

    /// Make sure `fields` survive the projection: added to an inclusive
    /// projection, removed from an exclusive one.
    pub fn widen<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut next = self.clone();
        for field in fields {
            if field == ID_FIELD {
                next.include_id = true;
                continue;
            }
            match next.mode {
                Mode::All => {}
                Mode::Include => insert_path(&mut next.tree, field),
                Mode::Exclude => {
                    let top = field.split('.').next().unwrap_or(field);
                    next.tree.remove(top);
                }
            }
        }
        if next.mode == Mode::Exclude && next.tree.is_empty() {
            next.mode = Mode::All;
        }
        next
    }

    /// Fold static mixin fields into the projection so they are delivered
    /// consistently with the rest of the document.
    pub fn with_mixin(&self, mixin: &Map<String, Value>) -> Self {
        self.widen(mixin.keys().map(String::as_str))
    }

    /// Render back into a `{ field: 0|1 }` spec (for handing to a store).
    pub fn to_spec(&self) -> Map<String, Value> {
        let mut paths = Vec::new();
        flatten(&self.tree, "", &mut paths);
        let mut spec = Map::new();
        let rule = if self.mode == Mode::Include { 1 } else { 0 };
        if self.mode != Mode::All {
            for path in paths {
                spec.insert(path, Value::from(rule));
            }
        }
        if !self.include_id {
            spec.insert(ID_FIELD.to_string(), Value::from(0));
        }
        spec
    }

    /// Project a whole document.
    pub fn apply(&self, doc: &Document) -> Document {
        let mut out = match self.mode {
            Mode::All => doc.clone(),
            Mode::Include => {
                let mut out = include_object(&self.tree, doc);
                if let Some(id) = doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
                out
            }
            Mode::Exclude => exclude_object(&self.tree, doc),
        };
        if !self.include_id {
            out.remove(ID_FIELD);
        }
        out
    }

    /// Project a set of top-level field changes. Removal markers (`None`) are
    /// kept for every field the projection lets through.
    pub fn apply_changes(&self, changes: &ChangedFields) -> ChangedFields {
        let mut out = ChangedFields::new();
        for (key, change) in changes {
            if key == ID_FIELD {
                if self.include_id {
                    out.insert(key.clone(), change.clone());
                }
                continue;
            }
            let projected = match (self.mode, self.tree.get(key)) {
                (Mode::All, _) => Some(change.clone()),
                (Mode::Include, None) | (Mode::Exclude, Some(Node::Leaf)) => None,
                (Mode::Include, Some(node)) => match change {
                    Some(value) => include_value(node, value).map(Some),
                    None => Some(None),
                },
                (Mode::Exclude, Some(Node::Branch(children))) => {
                    Some(change.as_ref().map(|v| exclude_value(children, v)))
                }
                (Mode::Exclude, None) => Some(change.clone()),
            };
            if let Some(change) = projected {
                out.insert(key.clone(), change);
            }
        }
        out
    }
}

// ============================================================================
// Tests
// ============================================================================
