//! Local application of Mongo-style update modifiers.
//!
//! Used to reconstruct a document from a notification that only carries a
//! modifier. Any failure leaves the target untouched; callers treat it as
//! "cannot resolve locally" and fall back to the store.

use serde_json::{Map, Number, Value};

use crate::error::ModifierError;
use crate::query::operators::{compare_values, values_equal};
use crate::types::{Document, ID_FIELD};

/// `true` if any top-level key of `modifier` is an operator (`$set`, ...).
pub fn contains_operators(modifier: &Value) -> bool {
    modifier
        .as_object()
        .is_some_and(|obj| obj.keys().any(|k| k.starts_with('$')))
}

/// `true` if `modifier` consists only of `$set` / `$unset`.
pub fn contains_only_setters(modifier: &Value) -> bool {
    modifier.as_object().is_some_and(|obj| {
        !obj.is_empty() && obj.keys().all(|k| k == "$set" || k == "$unset")
    })
}

/// Top-level fields a modifier definitely writes, when that can be known.
///
/// - replacement document → its keys
/// - only `$set` / `$unset` → the union of their (top-level) keys
/// - anything else → `None`
pub fn targeted_fields(modifier: &Value) -> Option<Vec<String>> {
    let obj = modifier.as_object()?;
    let top = |k: &String| k.split('.').next().unwrap_or(k).to_string();

    let mut fields: Vec<String> = if !contains_operators(modifier) {
        obj.keys().map(top).collect()
    } else if contains_only_setters(modifier) {
        ["$set", "$unset"]
            .iter()
            .filter_map(|op| obj.get(*op).and_then(Value::as_object))
            .flat_map(|m| m.keys().map(top))
            .collect()
    } else {
        return None;
    };
    fields.sort();
    fields.dedup();
    Some(fields)
}

/// Apply `modifier` to `doc`.
///
/// A modifier without operators replaces every field except `_id`. On error
/// `doc` is left exactly as it was.
pub fn apply_modifier(doc: &mut Document, modifier: &Value) -> Result<(), ModifierError> {
    let mods = modifier.as_object().ok_or(ModifierError::NotAnObject)?;

    let has_ops = mods.keys().any(|k| k.starts_with('$'));
    if has_ops && mods.keys().any(|k| !k.starts_with('$')) {
        return Err(ModifierError::MixedModifier);
    }

    if !has_ops {
        return replace_document(doc, mods);
    }

    let mut working = doc.clone();
    for (op, args) in mods {
        let args = args.as_object().ok_or_else(|| ModifierError::InvalidTarget {
            op: op.clone(),
            field: String::new(),
            reason: "operator argument must be an object".to_string(),
        })?;
        for (path, arg) in args {
            if path == ID_FIELD || path.starts_with("_id.") {
                return Err(invalid(op, path, "the _id field is immutable"));
            }
            apply_operator(&mut working, op, path, arg)?;
        }
    }
    *doc = working;
    Ok(())
}

fn replace_document(doc: &mut Document, replacement: &Map<String, Value>) -> Result<(), ModifierError> {
    if let (Some(new_id), Some(old_id)) = (replacement.get(ID_FIELD), doc.get(ID_FIELD)) {
        if new_id != old_id {
            return Err(invalid("replace", ID_FIELD, "the _id field is immutable"));
        }
    }
    let id = doc.get(ID_FIELD).cloned();
    let mut next = replacement.clone();
    if let Some(id) = id {
        next.insert(ID_FIELD.to_string(), id);
    }
    *doc = next;
    Ok(())
}

fn invalid(op: &str, field: &str, reason: &str) -> ModifierError {
    ModifierError::InvalidTarget {
        op: op.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// Path navigation
// ============================================================================

/// Walk to the parent object of `path`, creating intermediate objects when
/// `create` is set. Returns the parent and the final path segment.
fn parent_mut<'a>(
    doc: &'a mut Document,
    op: &str,
    path: &'a str,
    create: bool,
) -> Result<Option<(&'a mut Map<String, Value>, &'a str)>, ModifierError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    if last.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(invalid(op, path, "empty path segment"));
    }

    let mut current = doc;
    for seg in segments {
        if !current.contains_key(seg) {
            if !create {
                return Ok(None);
            }
            current.insert(seg.to_string(), Value::Object(Map::new()));
        }
        current = match current.get_mut(seg) {
            Some(Value::Object(child)) => child,
            Some(Value::Null) if !create => return Ok(None),
            _ => return Err(invalid(op, path, "cannot traverse a non-object value")),
        };
    }
    Ok(Some((current, last)))
}

fn number_arg(op: &str, path: &str, arg: &Value) -> Result<f64, ModifierError> {
    arg.as_f64()
        .ok_or_else(|| invalid(op, path, "modifier argument is not a number"))
}

/// Keep integers integral when both operands are integers.
fn arith(op: &str, current: Option<&Value>, arg: &Value, path: &str) -> Result<Value, ModifierError> {
    let rhs = number_arg(op, path, arg)?;
    let lhs = match current {
        None | Some(Value::Null) => 0.0,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| invalid(op, path, "target field is not a number"))?,
    };
    let current_int = match current {
        None | Some(Value::Null) => Some(0),
        Some(v) => v.as_i64(),
    };
    if let (Some(a), Some(b)) = (current_int, arg.as_i64()) {
        let out = if op == "$inc" { a.checked_add(b) } else { a.checked_mul(b) };
        if let Some(n) = out {
            return Ok(Value::Number(Number::from(n)));
        }
    }
    let out = if op == "$inc" { lhs + rhs } else { lhs * rhs };
    Number::from_f64(out)
        .map(Value::Number)
        .ok_or_else(|| invalid(op, path, "result is not a finite number"))
}

/// `$each` expansion for `$push` / `$addToSet`.
fn each_values(arg: &Value) -> Vec<Value> {
    match arg.as_object().and_then(|o| o.get("$each")).and_then(Value::as_array) {
        Some(items) => items.clone(),
        None => vec![arg.clone()],
    }
}

fn apply_operator(doc: &mut Document, op: &str, path: &str, arg: &Value) -> Result<(), ModifierError> {
    match op {
        "$set" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, true)? {
                parent.insert(key.to_string(), arg.clone());
            }
        }

        "$unset" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, false)? {
                parent.remove(key);
            }
        }

        // Only meaningful for inserts; an update never applies it.
        "$setOnInsert" => {}

        "$inc" | "$mul" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, true)? {
                let next = arith(op, parent.get(key), arg, path)?;
                parent.insert(key.to_string(), next);
            }
        }

        "$min" | "$max" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, true)? {
                let replace = match parent.get(key) {
                    None => true,
                    Some(current) => {
                        let cmp = compare_values(arg, current);
                        if op == "$min" {
                            cmp.is_lt()
                        } else {
                            cmp.is_gt()
                        }
                    }
                };
                if replace {
                    parent.insert(key.to_string(), arg.clone());
                }
            }
        }

        "$rename" => {
            let target = arg
                .as_str()
                .ok_or_else(|| invalid(op, path, "rename target must be a string"))?;
            let moved = match parent_mut(doc, op, path, false)? {
                Some((parent, key)) => parent.remove(key),
                None => None,
            };
            if let Some(value) = moved {
                if let Some((parent, key)) = parent_mut(doc, op, target, true)? {
                    parent.insert(key.to_string(), value);
                }
            }
        }

        "$push" | "$addToSet" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, true)? {
                let entry = parent
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let items = entry
                    .as_array_mut()
                    .ok_or_else(|| invalid(op, path, "target field is not an array"))?;
                for value in each_values(arg) {
                    if op == "$push" || !items.iter().any(|i| values_equal(i, &value)) {
                        items.push(value);
                    }
                }
            }
        }

        "$pull" | "$pullAll" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, false)? {
                if let Some(existing) = parent.get_mut(key) {
                    let items = existing
                        .as_array_mut()
                        .ok_or_else(|| invalid(op, path, "target field is not an array"))?;
                    let targets = if op == "$pullAll" {
                        arg.as_array()
                            .cloned()
                            .ok_or_else(|| invalid(op, path, "$pullAll requires an array"))?
                    } else {
                        vec![arg.clone()]
                    };
                    items.retain(|i| !targets.iter().any(|t| values_equal(i, t)));
                }
            }
        }

        "$pop" => {
            if let Some((parent, key)) = parent_mut(doc, op, path, false)? {
                if let Some(existing) = parent.get_mut(key) {
                    let items = existing
                        .as_array_mut()
                        .ok_or_else(|| invalid(op, path, "target field is not an array"))?;
                    if number_arg(op, path, arg)? < 0.0 {
                        if !items.is_empty() {
                            items.remove(0);
                        }
                    } else {
                        items.pop();
                    }
                }
            }
        }

        other => return Err(ModifierError::UnknownOperator(other.to_string())),
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
