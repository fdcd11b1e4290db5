// Structural change detection between a stored body and a candidate body.
// Schema-agnostic: works on any JSON object.

use std::collections::BTreeSet;

use gipfelbuch_store::document::{FIELD_CREATED_AT, FIELD_ID, FIELD_UPDATED_AT, FIELD_VERSION};
use serde::Serialize;
use serde_json::{Map, Value};

/// Bookkeeping fields never compared.
pub const EXCLUDED_FIELDS: [&str; 4] = [FIELD_ID, FIELD_VERSION, FIELD_CREATED_AT, FIELD_UPDATED_AT];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

/// Deep equality.
///
/// Objects compare key by key (a missing key equals `null`), arrays element
/// by element in order, numbers by numeric value so that `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y, &[]),
        _ => false,
    }
}

fn objects_equal(a: &Map<String, Value>, b: &Map<String, Value>, skip: &[&str]) -> bool {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .filter(|k| !skip.contains(&k.as_str()))
        .all(|k| optional_equal(a.get(k), b.get(k)))
}

fn optional_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (Some(x), Some(y)) => values_equal(x, y),
        _ => false,
    }
}

/// Top-level fields whose values differ between `existing` and `candidate`,
/// in field-name order.
pub fn detect_changes(existing: &Map<String, Value>, candidate: &Map<String, Value>) -> ChangeSet {
    let keys: BTreeSet<&String> = existing.keys().chain(candidate.keys()).collect();
    let changes = keys
        .into_iter()
        .filter(|k| !EXCLUDED_FIELDS.contains(&k.as_str()))
        .filter(|k| !optional_equal(existing.get(*k), candidate.get(*k)))
        .map(|k| FieldChange {
            field: k.clone(),
            before: existing.get(k).cloned(),
            after: candidate.get(k).cloned(),
        })
        .collect();
    ChangeSet { changes }
}

/// Same comparison as [`detect_changes`], without collecting the changes.
pub fn has_changes(existing: &Map<String, Value>, candidate: &Map<String, Value>) -> bool {
    !objects_equal(existing, candidate, &EXCLUDED_FIELDS)
}
