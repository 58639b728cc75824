//! Identifier input shapes and deep normalization.

use super::id::{parse_canonical, RecordId};
use super::intern::IdentityCache;
use crate::value::{Value, FIELD_ID};
use std::fmt;

/// Every shape an identifier arrives in.
///
/// Canonicalization dispatches over this sum type instead of sniffing
/// runtime shapes at each call site.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordIdInput {
    /// A textual variant, possibly quoted or bracketed.
    Text(String),
    /// Separate `{table, id}` parts.
    Parts {
        /// Table name.
        table: String,
        /// Key, textual form (numeric keys arrive stringified).
        key: String,
    },
    /// A `{id: <variant>}` wrapper around another shape.
    Wrapped(Box<RecordIdInput>),
}

impl RecordIdInput {
    /// Builds an input from any foreign value whose text form is canonical.
    pub fn from_display<T: fmt::Display>(value: &T) -> Self {
        Self::Text(value.to_string())
    }

    /// Extracts an input from a document value, if it looks like one.
    ///
    /// Typed records and strings are taken as-is; objects are accepted in
    /// the `{table, id}` shape (key as string or integer) and the
    /// `{id: <variant>}` wrapper shape. Free-form values return `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Record(id) => Some(Self::Text(id.canonical().to_owned())),
            Value::Str(s) => Some(Self::Text(s.clone())),
            Value::Object(map) => {
                if let (Some(Value::Str(table)), Some(id), 2) =
                    (map.get("table"), map.get(FIELD_ID), map.len())
                {
                    let key = match id {
                        Value::Str(s) => s.clone(),
                        Value::Int(i) => i.to_string(),
                        _ => return None,
                    };
                    return Some(Self::Parts {
                        table: table.clone(),
                        key,
                    });
                }
                if map.len() == 1 {
                    if let Some(inner) = map.get(FIELD_ID) {
                        return Self::from_value(inner).map(|i| Self::Wrapped(Box::new(i)));
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// The canonical `"<table>:<key>"` form, if the input denotes one.
    ///
    /// Never panics on arbitrary data; ambiguous inputs return `None`.
    #[must_use]
    pub fn to_canonical_string(&self) -> Option<String> {
        match self {
            Self::Text(text) => {
                let (table, key) = parse_canonical(text)?;
                Some(format!("{table}:{key}"))
            }
            Self::Parts { table, key } => {
                Some(RecordId::from_parts(table, key)?.canonical().to_owned())
            }
            Self::Wrapped(inner) => inner.to_canonical_string(),
        }
    }
}

impl From<&str> for RecordIdInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for RecordIdInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&RecordId> for RecordIdInput {
    fn from(id: &RecordId) -> Self {
        Self::Text(id.canonical().to_owned())
    }
}

/// Walks a value tree, replacing record-id-like leaves with interned
/// records.
///
/// Typed [`Value::Record`] leaves are re-pointed at the pool instance and
/// `{table, id}` shaped objects become records. Strings are never
/// reinterpreted (a title like `"a:b"` must survive), and dates, bytes,
/// and scalars pass through untouched.
#[must_use]
pub fn normalize_deep(value: Value, cache: &IdentityCache) -> Value {
    match value {
        Value::Record(id) => Value::Record(cache.adopt(&id)),
        Value::Object(map) => {
            if looks_like_id_object(&map) {
                if let Some(id) = RecordIdInput::from_value(&Value::Object(map.clone()))
                    .and_then(|input| cache.intern(&input))
                {
                    return Value::Record(id);
                }
                return Value::Object(map);
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_deep(v, cache)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| normalize_deep(v, cache))
                .collect(),
        ),
        other => other,
    }
}

fn looks_like_id_object(map: &std::collections::BTreeMap<String, Value>) -> bool {
    map.len() == 2
        && matches!(map.get("table"), Some(Value::Str(_)))
        && matches!(map.get(FIELD_ID), Some(Value::Str(_) | Value::Int(_)))
}
