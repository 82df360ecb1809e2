//! Selector matching for cached documents, with Mongo-style array lifting.
//!
//! A selector is validated once by [`Matcher::compile`]; unknown operators and
//! bad regexes surface there, so [`Matcher::matches`] itself cannot fail.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::types::Document;

// ============================================================================
// Value Comparison
// ============================================================================

/// Total order over JSON values used by sorting and range operators.
///
/// Nulls sort after everything else. Values of different kinds order
/// numbers, then strings, then booleans, then arrays and objects; numbers
/// compare as `f64` (an incomparable pair counts as equal).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

/// Numeric-aware equality: `1` and `1.0` are equal, everything else is `==`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => match (na.as_f64(), nb.as_f64()) {
            (Some(fa), Some(fb)) => fa == fb,
            _ => na == nb,
        },
        _ => a == b,
    }
}

// ============================================================================
// Operator Detection
// ============================================================================

/// `{ "$gt": 1, "$lt": 5 }`-style operator object: non-empty, every key `$`-prefixed.
pub fn is_operator(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')))
}

// ============================================================================
// Field Path Resolution
// ============================================================================

/// Resolve a dotted path (`"address.city"`) inside `doc`.
pub fn get_field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |node, segment| node.as_object()?.get(segment))
}

/// [`get_field_value`] rooted at a document instead of a `Value`.
pub fn get_document_field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        Some((head, rest)) => get_field_value(doc.get(head)?, rest),
        None => doc.get(path),
    }
}

// ============================================================================
// Validation
// ============================================================================

const FIELD_OPS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$regex", "$options", "$size",
    "$exists", "$all", "$contains", "$containsAny", "$not",
];

const LOGICAL_OPS: &[&str] = &["$and", "$or", "$nor", "$not"];

fn regex_pattern(pattern: &str, options: Option<&str>) -> String {
    let flags: String = options
        .unwrap_or("")
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    }
}

fn validate_operators(
    ops: &Map<String, Value>,
    regexes: &mut HashMap<String, Regex>,
) -> Result<(), QueryError> {
    for (op, operand) in ops {
        if !FIELD_OPS.contains(&op.as_str()) {
            return Err(QueryError::UnknownOperator(op.clone()));
        }
        match op.as_str() {
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| QueryError::InvalidRegex(operand.to_string()))?;
                let full = regex_pattern(pattern, ops.get("$options").and_then(Value::as_str));
                if !regexes.contains_key(&full) {
                    let re =
                        Regex::new(&full).map_err(|e| QueryError::InvalidRegex(e.to_string()))?;
                    regexes.insert(full, re);
                }
            }
            "$not" => match operand.as_object() {
                Some(inner) if is_operator(operand) => validate_operators(inner, regexes)?,
                _ => return Err(QueryError::InvalidSelector(operand.to_string())),
            },
            _ => {}
        }
    }
    Ok(())
}

fn validate_selector(
    selector: &Value,
    regexes: &mut HashMap<String, Regex>,
) -> Result<(), QueryError> {
    let obj = selector
        .as_object()
        .ok_or_else(|| QueryError::InvalidSelector(selector.to_string()))?;

    for (key, condition) in obj {
        if key.starts_with('$') {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let subs = condition
                        .as_array()
                        .ok_or_else(|| QueryError::InvalidSelector(condition.to_string()))?;
                    for sub in subs {
                        validate_selector(sub, regexes)?;
                    }
                }
                "$not" => validate_selector(condition, regexes)?,
                other => return Err(QueryError::UnknownOperator(other.to_string())),
            }
            continue;
        }
        if let Some(ops) = condition.as_object() {
            if is_operator(condition) {
                validate_operators(ops, regexes)?;
            } else if ops.keys().any(|k| k.starts_with('$')) {
                // {$gt: 1, plain: 2} is neither a literal nor an operator object
                return Err(QueryError::InvalidSelector(condition.to_string()));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Matcher
// ============================================================================

/// A compiled selector.
#[derive(Debug, Clone)]
pub struct Matcher {
    selector: Value,
    regexes: HashMap<String, Regex>,
}

impl Matcher {
    /// Validate `selector` and precompile its regexes.
    pub fn compile(selector: &Value) -> Result<Self, QueryError> {
        let mut regexes = HashMap::new();
        validate_selector(selector, &mut regexes)?;
        Ok(Self {
            selector: selector.clone(),
            regexes,
        })
    }

    pub fn selector(&self) -> &Value {
        &self.selector
    }

    /// Whether `doc` satisfies the selector.
    pub fn matches(&self, doc: &Document) -> bool {
        // Documents are objects; wrap once so path lookups share one code path.
        let value = Value::Object(doc.clone());
        self.matches_value(&value, &self.selector)
    }

    /// Top-level field names the selector reads (not descending into
    /// operator objects). Logical operators are flattened.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_fields(&self.selector, &mut out);
        out.sort();
        out.dedup();
        out
    }

    fn matches_value(&self, doc: &Value, selector: &Value) -> bool {
        let filter_obj = match selector.as_object() {
            Some(o) => o,
            None => return true,
        };

        if let Some(subs) = filter_obj.get("$and").and_then(Value::as_array) {
            if !subs.iter().all(|sub| self.matches_value(doc, sub)) {
                return false;
            }
        }

        if let Some(subs) = filter_obj.get("$or").and_then(Value::as_array) {
            if !subs.iter().any(|sub| self.matches_value(doc, sub)) {
                return false;
            }
        }

        if let Some(subs) = filter_obj.get("$nor").and_then(Value::as_array) {
            if subs.iter().any(|sub| self.matches_value(doc, sub)) {
                return false;
            }
        }

        if let Some(not_val) = filter_obj.get("$not") {
            if self.matches_value(doc, not_val) {
                return false;
            }
        }

        for (key, field_filter) in filter_obj {
            if LOGICAL_OPS.contains(&key.as_str()) {
                continue;
            }
            let value = get_field_value(doc, key);
            if !self.evaluate_field_filter(value, field_filter) {
                return false;
            }
        }

        true
    }

    /// Evaluate a field condition (direct value or operator object).
    ///
    /// `value` is `None` when the path is absent, which only `$exists` can
    /// tell apart from an explicit `null`.
    fn evaluate_field_filter(&self, value: Option<&Value>, filter: &Value) -> bool {
        if let Some(ops) = filter.as_object().filter(|_| is_operator(filter)) {
            self.evaluate_operators(value, ops)
        } else {
            evaluate_single_operator(value.unwrap_or(&Value::Null), "$eq", filter)
        }
    }

    fn evaluate_operators(&self, value: Option<&Value>, ops: &Map<String, Value>) -> bool {
        for (op, operand) in ops {
            let ok = match op.as_str() {
                "$exists" => operand.as_bool().unwrap_or(false) == value.is_some(),
                "$options" => true,
                "$not" => match operand.as_object() {
                    Some(inner) => !self.evaluate_operators(value, inner),
                    None => true,
                },
                "$regex" => {
                    let full = regex_pattern(
                        operand.as_str().unwrap_or(""),
                        ops.get("$options").and_then(Value::as_str),
                    );
                    match (value, self.regexes.get(&full)) {
                        (Some(Value::String(s)), Some(re)) => re.is_match(s),
                        (Some(Value::Array(items)), Some(re)) => items
                            .iter()
                            .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                        _ => false,
                    }
                }
                _ => {
                    let value = value.unwrap_or(&Value::Null);
                    match evaluate_array_operator(value, op, operand) {
                        Some(result) => result,
                        None => evaluate_single_operator(value, op, operand),
                    }
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

fn collect_fields(selector: &Value, out: &mut Vec<String>) {
    let Some(obj) = selector.as_object() else {
        return;
    };
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for sub in value.as_array().into_iter().flatten() {
                    collect_fields(sub, out);
                }
            }
            "$not" => collect_fields(value, out),
            k if !k.starts_with('$') => {
                let top = k.split('.').next().unwrap_or(k);
                out.push(top.to_string());
            }
            _ => {}
        }
    }
}

// ============================================================================
// Operator Evaluation
// ============================================================================

/// One operator against one value, without array lifting.
fn evaluate_scalar_operator(value: &Value, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => values_equal(value, operand),

        "$ne" => !values_equal(value, operand),

        "$gt" | "$gte" | "$lt" | "$lte" => {
            if value.is_null() || operand.is_null() {
                return false;
            }
            let cmp = compare_values(value, operand);
            match op {
                "$gt" => cmp == Ordering::Greater,
                "$gte" => cmp != Ordering::Less,
                "$lt" => cmp == Ordering::Less,
                _ => cmp != Ordering::Greater,
            }
        }

        "$in" => {
            let Some(items) = operand.as_array() else {
                return false;
            };
            // array value: any element listed in the operand
            if let Some(arr) = value.as_array() {
                return arr
                    .iter()
                    .any(|v| items.iter().any(|item| values_equal(v, item)));
            }
            items.iter().any(|item| values_equal(value, item))
        }

        "$nin" => !evaluate_scalar_operator(value, "$in", operand),

        "$size" => match (value.as_array(), operand.as_f64()) {
            (Some(arr), Some(n)) => arr.len() as f64 == n,
            _ => false,
        },

        // compile() rejects anything else
        _ => false,
    }
}

/// Against an array value with a scalar operand these hold if any element matches.
const LIFTABLE_OPS: &[&str] = &["$eq", "$gt", "$gte", "$lt", "$lte"];
/// Against an array value these must hold for every element.
const LIFTABLE_INVERTED_OPS: &[&str] = &["$ne"];

/// One operator against one value, lifting over array values where Mongo does.
fn evaluate_single_operator(value: &Value, op: &str, operand: &Value) -> bool {
    if let Some(arr) = value.as_array() {
        if !operand.is_array() {
            if LIFTABLE_OPS.contains(&op) {
                return arr
                    .iter()
                    .any(|elem| evaluate_scalar_operator(elem, op, operand));
            }
            if LIFTABLE_INVERTED_OPS.contains(&op) {
                return arr
                    .iter()
                    .all(|elem| evaluate_scalar_operator(elem, op, operand));
            }
        }
    }
    evaluate_scalar_operator(value, op, operand)
}

/// Evaluate an array-specific operator. Returns None if not an array operator.
fn evaluate_array_operator(value: &Value, op: &str, operand: &Value) -> Option<bool> {
    let contains = |arr: &Vec<Value>, target: &Value| arr.iter().any(|i| values_equal(i, target));
    match op {
        "$contains" => Some(value.as_array().is_some_and(|arr| contains(arr, operand))),

        "$containsAny" => Some(match (value.as_array(), operand.as_array()) {
            (Some(arr), Some(targets)) => targets.iter().any(|t| contains(arr, t)),
            _ => false,
        }),

        // empty operand matches everything
        "$all" => Some(match (value.as_array(), operand.as_array()) {
            (Some(arr), Some(targets)) => targets.iter().all(|t| contains(arr, t)),
            _ => false,
        }),

        _ => None,
    }
}

// ============================================================================
// Tests (inline unit tests)
// ============================================================================
