//! Materialization profiles.
//!
//! A profile pairs the two directions of a document: how a submitted row
//! becomes container writes, and how the containers project back into a
//! row. Profiles are values; both work against the [`CrdtDoc`] capability
//! only.

use crate::engine::CrdtDoc;
use tidemark_core::value::FIELD_ID;
use tidemark_core::{RecordId, Row, Value};

/// The root map container every profile writes metadata into.
pub const ROOT_MAP: &str = "root";
/// The text container the richtext profile keeps its body in.
pub const CONTENT_TEXT: &str = "content";
/// Root-map flag set by delete changes.
pub const DELETED_FLAG: &str = "deleted";

/// A local mutation to fold into a document.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// A full row was inserted.
    Insert(Row),
    /// A partial row was merged.
    Update(Row),
    /// The row was deleted.
    Delete,
}

impl LocalChange {
    /// The submitted row, when the change carries one.
    #[must_use]
    pub fn row(&self) -> Option<&Row> {
        match self {
            LocalChange::Insert(row) | LocalChange::Update(row) => Some(row),
            LocalChange::Delete => None,
        }
    }
}

/// How documents materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Plain documents: the root map is the row.
    #[default]
    Json,
    /// Collaborative text: `content` is a text container, everything else
    /// is metadata in the root map.
    Richtext,
}

impl Profile {
    /// Folds a local change into the document's containers.
    ///
    /// The `id` field never enters a container; it is reattached during
    /// materialization. Deletes set the [`DELETED_FLAG`] in the root map.
    pub fn apply_local_change(&self, doc: &mut dyn CrdtDoc, change: &LocalChange) {
        match change {
            LocalChange::Insert(row) | LocalChange::Update(row) => {
                for (field, value) in row.iter() {
                    if field == FIELD_ID {
                        continue;
                    }
                    match self {
                        Profile::Richtext if field == CONTENT_TEXT => {
                            let text = match value {
                                Value::Str(s) => s.clone(),
                                other => other.to_json().to_string(),
                            };
                            doc.text_update(CONTENT_TEXT, &text);
                        }
                        _ => doc.map_set(ROOT_MAP, field, value.clone()),
                    }
                }
            }
            LocalChange::Delete => {
                doc.map_set(ROOT_MAP, DELETED_FLAG, Value::Bool(true));
            }
        }
    }

    /// Projects the document into a row, with `id` overwritten to the
    /// canonical record id.
    #[must_use]
    pub fn materialize(&self, doc: &dyn CrdtDoc, id: &RecordId) -> Row {
        let mut row: Row = doc.map_entries(ROOT_MAP).into_iter().collect();
        if *self == Profile::Richtext {
            row.set(CONTENT_TEXT, doc.text_to_string(CONTENT_TEXT));
        }
        row.set(FIELD_ID, id.clone());
        row
    }

    /// True once a delete change has been applied.
    #[must_use]
    pub fn is_deleted(&self, doc: &dyn CrdtDoc) -> bool {
        matches!(
            doc.map_entries(ROOT_MAP).get(DELETED_FLAG),
            Some(Value::Bool(true))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CrdtEngine, LwwEngine};

    fn id() -> RecordId {
        RecordId::parse("doc:abc").unwrap()
    }

    #[test]
    fn json_profile_roundtrip() {
        let mut doc = LwwEngine.create_doc("a");
        let change = LocalChange::Insert(
            Row::new()
                .with("id", "doc:abc")
                .with("title", "hello")
                .with("rank", 3i64),
        );
        Profile::Json.apply_local_change(doc.as_mut(), &change);

        let view = Profile::Json.materialize(doc.as_ref(), &id());
        assert_eq!(view.get("title"), Some(&Value::Str("hello".into())));
        assert_eq!(view.get("rank"), Some(&Value::Int(3)));
        // The submitted id never enters the map; the canonical one is
        // attached at materialization.
        assert_eq!(view.id(), Some(&Value::Record(id())));
        assert!(!Profile::Json.is_deleted(doc.as_ref()));
    }

    #[test]
    fn json_delete_sets_flag() {
        let mut doc = LwwEngine.create_doc("a");
        Profile::Json.apply_local_change(doc.as_mut(), &LocalChange::Delete);
        assert!(Profile::Json.is_deleted(doc.as_ref()));
        let view = Profile::Json.materialize(doc.as_ref(), &id());
        assert_eq!(view.get(DELETED_FLAG), Some(&Value::Bool(true)));
    }

    #[test]
    fn richtext_content_goes_to_text_container() {
        let mut doc = LwwEngine.create_doc("a");
        let change = LocalChange::Insert(
            Row::new()
                .with("content", "the body")
                .with("author", "ada"),
        );
        Profile::Richtext.apply_local_change(doc.as_mut(), &change);

        assert_eq!(doc.text_to_string(CONTENT_TEXT), "the body");
        assert!(doc.map_entries(ROOT_MAP).get("content").is_none());

        let view = Profile::Richtext.materialize(doc.as_ref(), &id());
        assert_eq!(view.get("content"), Some(&Value::Str("the body".into())));
        assert_eq!(view.get("author"), Some(&Value::Str("ada".into())));
    }

    #[test]
    fn richtext_content_writes_replace() {
        let mut doc = LwwEngine.create_doc("a");
        for text in ["v1", "v2"] {
            Profile::Richtext.apply_local_change(
                doc.as_mut(),
                &LocalChange::Update(Row::new().with("content", text)),
            );
        }
        assert_eq!(doc.text_to_string(CONTENT_TEXT), "v2");
    }

    #[test]
    fn applying_same_change_twice_is_stable() {
        let mut doc = LwwEngine.create_doc("a");
        let change = LocalChange::Update(Row::new().with("title", "same"));
        Profile::Json.apply_local_change(doc.as_mut(), &change);
        let once = Profile::Json.materialize(doc.as_ref(), &id());
        Profile::Json.apply_local_change(doc.as_mut(), &change);
        let twice = Profile::Json.materialize(doc.as_ref(), &id());
        assert_eq!(once, twice);
    }
}
