//! The document value model.
//!
//! Rows fetched from the remote, rows handed to the host runtime, CRDT
//! register contents, and query bindings all share this representation.
//! JSON interop is lossy in one direction only: [`Value::to_json`] renders
//! records, datetimes, and bytes as strings, while the serde form used for
//! persisted payloads keeps them tagged so a round-trip preserves types.

use crate::record::RecordId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Reserved field: the record identifier.
pub const FIELD_ID: &str = "id";
/// Reserved sync field: boolean tombstone.
pub const FIELD_SYNC_DELETED: &str = "sync_deleted";
/// Reserved sync field: last-writer-wins timestamp.
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// A single document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The remote's `NONE` (absent field).
    None,
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// An interned record identifier.
    Record(RecordId),
    /// A point in time.
    DateTime(DateTime<Utc>),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list.
    Array(Vec<Value>),
    /// Field map with sorted keys.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the record identifier, if this is a record.
    #[must_use]
    pub fn as_record(&self) -> Option<&RecordId> {
        match self {
            Value::Record(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the object map, if this is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the datetime, if this is a datetime.
    #[must_use]
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// True for `None` and `Null`.
    #[must_use]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::None | Value::Null)
    }

    /// Renders to untyped JSON: records as canonical strings, datetimes as
    /// RFC 3339, bytes as base64, `None` as null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Record(id) => serde_json::Value::String(id.canonical().to_owned()),
            Value::DateTime(dt) => serde_json::Value::String(rfc3339(dt)),
            Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Imports untyped JSON verbatim; strings stay strings.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Typed serde form: records, datetimes, and bytes survive a round-trip
    /// through `{"$record"}`, `{"$datetime"}`, and `{"$bytes"}` tags.
    fn to_tagged_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::json!({ "$none": true }),
            Value::Record(id) => serde_json::json!({ "$record": id.canonical() }),
            Value::DateTime(dt) => serde_json::json!({ "$datetime": rfc3339(dt) }),
            Value::Bytes(b) => serde_json::json!({ "$bytes": BASE64.encode(b) }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_tagged_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_tagged_json()))
                    .collect(),
            ),
            other => other.to_json(),
        }
    }

    fn from_tagged_json(json: serde_json::Value) -> Result<Self, String> {
        if let serde_json::Value::Object(map) = &json {
            if map.len() == 1 {
                if let Some((tag, inner)) = map.iter().next() {
                    match tag.as_str() {
                        "$none" => return Ok(Value::None),
                        "$record" => {
                            let text = inner.as_str().ok_or("$record must be a string")?;
                            let id = RecordId::parse(text)
                                .ok_or_else(|| format!("invalid record id {text:?}"))?;
                            return Ok(Value::Record(id));
                        }
                        "$datetime" => {
                            let text = inner.as_str().ok_or("$datetime must be a string")?;
                            let dt = DateTime::parse_from_rfc3339(text)
                                .map_err(|e| e.to_string())?;
                            return Ok(Value::DateTime(dt.with_timezone(&Utc)));
                        }
                        "$bytes" => {
                            let text = inner.as_str().ok_or("$bytes must be a string")?;
                            let bytes = BASE64.decode(text).map_err(|e| e.to_string())?;
                            return Ok(Value::Bytes(bytes));
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(match json {
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_tagged_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Value::from_tagged_json(v).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
            other => Value::from_json(other),
        })
    }

    /// Structural equivalence for diffing.
    ///
    /// A datetime and its RFC 3339 string compare equal, and integers
    /// compare equal to the same floating-point quantity; everything else
    /// is plain structural equality (objects already keep sorted keys).
    #[must_use]
    pub fn equivalent(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::DateTime(dt), Value::Str(s)) | (Value::Str(s), Value::DateTime(dt)) => {
                s == &rfc3339(dt)
            }
            (Value::DateTime(a), Value::DateTime(b)) => rfc3339(a) == rfc3339(b),
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                (*i as f64) == *f
            }
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Record(id), Value::Str(s)) | (Value::Str(s), Value::Record(id)) => {
                s == id.canonical()
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equivalent(vb))
            }
            (a, b) => a == b,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_tagged_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_tagged_json(json).map_err(D::Error::custom)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Value::Record(id)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

fn rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A row: an ordered field map containing at minimum an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Writes a field, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Writes a field in place.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// True if the field is present.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Iterates fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `id` field.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.0.get(FIELD_ID)
    }

    /// The tombstone flag; a missing field reads as not deleted.
    #[must_use]
    pub fn sync_deleted(&self) -> bool {
        matches!(self.0.get(FIELD_SYNC_DELETED), Some(Value::Bool(true)))
    }

    /// The `updated_at` sync field, if present.
    #[must_use]
    pub fn updated_at(&self) -> Option<&Value> {
        self.0.get(FIELD_UPDATED_AT)
    }

    /// Overlays every field of `patch` onto this row.
    pub fn merge(&mut self, patch: Row) {
        for (field, value) in patch.0 {
            self.0.insert(field, value);
        }
    }

    /// Field-by-field structural equivalence (see [`Value::equivalent`]).
    #[must_use]
    pub fn equivalent(&self, other: &Row) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((ka, va), (kb, vb))| ka == kb && va.equivalent(vb))
    }

    /// Compares only the `(sync_deleted, updated_at)` pair.
    #[must_use]
    pub fn sync_fields_equal(&self, other: &Row) -> bool {
        if self.sync_deleted() != other.sync_deleted() {
            return false;
        }
        match (self.updated_at(), other.updated_at()) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equivalent(b),
            _ => false,
        }
    }

    /// Renders to an untyped JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.0.clone()).to_json()
    }

    /// Imports a JSON object; returns `None` for non-objects.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        match Value::from_json(json) {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Row {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Row> for BTreeMap<String, Value> {
    fn from(row: Row) -> Self {
        row.0
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_dt() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn datetime_equals_its_iso_string() {
        let dt = Value::DateTime(sample_dt());
        let s = Value::Str("2024-03-15T12:00:00.000Z".into());
        assert!(dt.equivalent(&s));
        assert!(s.equivalent(&dt));
        assert!(!dt.equivalent(&Value::Str("2024-03-15T12:00:01.000Z".into())));
    }

    #[test]
    fn int_float_cross_compare() {
        assert!(Value::Int(1).equivalent(&Value::Float(1.0)));
        assert!(!Value::Int(1).equivalent(&Value::Float(1.5)));
    }

    #[test]
    fn record_equals_its_canonical_string() {
        let id = RecordId::parse("products:1").unwrap();
        assert!(Value::Record(id).equivalent(&Value::Str("products:1".into())));
    }

    #[test]
    fn tagged_serde_roundtrip() {
        let id = RecordId::parse("products:1").unwrap();
        let value = Value::Object(
            [
                ("id".to_owned(), Value::Record(id.clone())),
                ("at".to_owned(), Value::DateTime(sample_dt())),
                ("raw".to_owned(), Value::Bytes(vec![1, 2, 3])),
                ("title".to_owned(), Value::Str("a:b looks like an id".into())),
                ("missing".to_owned(), Value::None),
            ]
            .into_iter()
            .collect(),
        );

        let text = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
        // Strings never come back as records.
        let obj = back.as_object().unwrap();
        assert!(matches!(obj.get("title"), Some(Value::Str(_))));
        assert!(matches!(obj.get("id"), Some(Value::Record(_))));
    }

    #[test]
    fn untyped_json_renders_strings() {
        let id = RecordId::parse("products:1").unwrap();
        let row = Row::new()
            .with("id", Value::Record(id))
            .with("at", Value::DateTime(sample_dt()));
        let json = row.to_json();
        assert_eq!(json["id"], "products:1");
        assert_eq!(json["at"], "2024-03-15T12:00:00.000Z");
    }

    #[test]
    fn row_merge_overlays() {
        let mut row = Row::new().with("a", 1i64).with("b", "x");
        row.merge(Row::new().with("b", "y").with("c", true));
        assert_eq!(row.get("a"), Some(&Value::Int(1)));
        assert_eq!(row.get("b"), Some(&Value::Str("y".into())));
        assert_eq!(row.get("c"), Some(&Value::Bool(true)));
    }

    #[test]
    fn sync_field_pair_comparison() {
        let a = Row::new()
            .with(FIELD_SYNC_DELETED, false)
            .with(FIELD_UPDATED_AT, Value::DateTime(sample_dt()));
        let b = Row::new()
            .with(FIELD_SYNC_DELETED, false)
            .with(FIELD_UPDATED_AT, Value::Str("2024-03-15T12:00:00.000Z".into()));
        assert!(a.sync_fields_equal(&b));

        let c = Row::new()
            .with(FIELD_SYNC_DELETED, true)
            .with(FIELD_UPDATED_AT, Value::DateTime(sample_dt()));
        assert!(!a.sync_fields_equal(&c));
    }

    #[test]
    fn missing_tombstone_reads_false() {
        assert!(!Row::new().sync_deleted());
        assert!(Row::new().with(FIELD_SYNC_DELETED, true).sync_deleted());
    }
}
