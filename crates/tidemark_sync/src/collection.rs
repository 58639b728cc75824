//! The adapter facade handed to the host runtime.

use crate::config::{CollectionOptions, SyncMode};
use crate::engine::{SyncEngine, SyncEngineState, SyncStats, PENDING_KEY_PREFIX};
use crate::error::{SyncError, SyncResult};
use crate::host::SyncSession;
use parking_lot::Mutex;
use std::sync::Arc;
use tidemark_core::value::FIELD_ID;
use tidemark_core::{normalize_deep, IdentityCache, RecordIdInput, Row, Value};
use tidemark_remote::{RemoteDatabase, Subset};
use uuid::Uuid;

/// One host-side mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// The record key, when the host knows it (canonical or bare).
    pub key: Option<String>,
    /// The submitted row: full for inserts, partial for updates, empty
    /// for deletes.
    pub data: Row,
}

impl Mutation {
    /// An insert carrying a full row.
    #[must_use]
    pub fn insert(data: Row) -> Self {
        Self { key: None, data }
    }

    /// An update of the record under `key` with a partial row.
    pub fn update(key: impl Into<String>, data: Row) -> Self {
        Self {
            key: Some(key.into()),
            data,
        }
    }

    /// A delete of the record under `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            data: Row::new(),
        }
    }
}

/// The control surface returned from [`Collection::start_sync`].
pub struct SyncControl<R: RemoteDatabase + 'static> {
    engine: Arc<SyncEngine<R>>,
}

impl<R: RemoteDatabase + 'static> SyncControl<R> {
    /// Loads a subset (on-demand mode).
    pub fn load_subset(&self, subset: &Subset) -> SyncResult<()> {
        self.engine.load_subset(subset)
    }

    /// Unloads a subset; the last unload closes the live stream.
    pub fn unload_subset(&self, subset: &Subset) {
        self.engine.unload_subset(subset);
    }

    /// Tears the sync down. Idempotent.
    pub fn cleanup(&self) {
        self.engine.cleanup();
    }

    /// The engine's lifecycle state.
    #[must_use]
    pub fn state(&self) -> SyncEngineState {
        self.engine.state()
    }

    /// The engine's lifetime counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }
}

impl<R: RemoteDatabase + 'static> std::fmt::Debug for SyncControl<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncControl")
            .field("state", &self.state())
            .finish()
    }
}

/// One synced collection: schema validation, key extraction, the sync
/// entrypoint, and the mutation handlers the host runtime calls.
pub struct Collection<R: RemoteDatabase + 'static> {
    options: CollectionOptions<R>,
    ids: Arc<IdentityCache>,
    engine: Mutex<Option<Arc<SyncEngine<R>>>>,
}

impl<R: RemoteDatabase + 'static> Collection<R> {
    /// Builds a collection from its options.
    pub fn new(options: CollectionOptions<R>) -> Self {
        Self {
            options,
            ids: Arc::new(IdentityCache::new()),
            engine: Mutex::new(None),
        }
    }

    /// The intern pool backing this collection's identifiers.
    #[must_use]
    pub fn identity_cache(&self) -> &Arc<IdentityCache> {
        &self.ids
    }

    /// The host cache-key scope this collection is filed under.
    #[must_use]
    pub fn query_key(&self) -> &[String] {
        &self.options.query_key
    }

    /// The configured sync mode.
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.options.sync_mode
    }

    /// Extracts the host key (the canonical id) from a row.
    #[must_use]
    pub fn get_key(&self, row: &Row) -> Option<String> {
        row.id()
            .and_then(RecordIdInput::from_value)
            .and_then(|input| input.to_canonical_string())
    }

    /// Validates an insert input.
    ///
    /// Non-objects are rejected with an issue; a missing id gets a
    /// sentinel-prefixed temporary key; record-id-like fields are deep
    /// normalized into interned references.
    pub fn validate_insert(&self, value: Value) -> SyncResult<Row> {
        // Fields are normalized individually; the row itself must stay an
        // object even when it happens to look id-shaped.
        let mut row = match value {
            Value::Object(map) => map
                .into_iter()
                .map(|(field, value)| (field, normalize_deep(value, &self.ids)))
                .collect::<Row>(),
            other => {
                return Err(SyncError::schema_rejected(format!(
                    "insert input must be an object, got {other:?}"
                )))
            }
        };

        let has_id = row
            .id()
            .and_then(RecordIdInput::from_value)
            .and_then(|input| self.ids.intern(&input))
            .is_some();
        if !has_id {
            let key = format!("{PENDING_KEY_PREFIX}{}", Uuid::new_v4().simple());
            let id = self
                .ids
                .intern_parts(&self.options.table.name, &key)
                .ok_or(SyncError::MissingKey)?;
            row.set(FIELD_ID, id);
        } else if let Some(id) = row.id().and_then(RecordIdInput::from_value) {
            // Re-point the id field at the interned reference.
            if let Some(id) = self.ids.intern(&id) {
                row.set(FIELD_ID, id);
            }
        }
        Ok(row)
    }

    /// Starts (or restarts) the sync with a host session.
    ///
    /// A previous sync for this collection is torn down first.
    pub fn start_sync(&self, session: Arc<dyn SyncSession>) -> SyncControl<R> {
        let engine = SyncEngine::new(&self.options, Arc::clone(&self.ids), session);
        let previous = self.engine.lock().replace(Arc::clone(&engine));
        if let Some(previous) = previous {
            previous.cleanup();
        }
        engine.start();
        SyncControl { engine }
    }

    /// Host mutation handler: inserts.
    pub fn on_insert(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.running_engine()?.apply_insert(mutations)
    }

    /// Host mutation handler: updates.
    pub fn on_update(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.running_engine()?.apply_update(mutations)
    }

    /// Host mutation handler: deletes.
    pub fn on_delete(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.running_engine()?.apply_delete(mutations)
    }

    fn running_engine(&self) -> SyncResult<Arc<SyncEngine<R>>> {
        self.engine
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(SyncError::NotStarted)
    }
}

impl<R: RemoteDatabase + 'static> std::fmt::Debug for Collection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("options", &self.options)
            .field("interned_ids", &self.ids.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::RecordId;
    use tidemark_remote::{MemoryRemote, TableTarget};

    fn collection() -> Collection<MemoryRemote> {
        Collection::new(CollectionOptions::new(
            Arc::new(MemoryRemote::new()),
            TableTarget::new("task"),
        ))
    }

    #[test]
    fn rejects_non_object_inserts() {
        let c = collection();
        assert!(matches!(
            c.validate_insert(Value::Int(7)),
            Err(SyncError::SchemaRejected { .. })
        ));
        assert!(matches!(
            c.validate_insert(Value::Str("nope".into())),
            Err(SyncError::SchemaRejected { .. })
        ));
    }

    #[test]
    fn generates_pending_ids() {
        let c = collection();
        let row = c
            .validate_insert(Value::Object(
                [("title".to_owned(), Value::Str("x".into()))]
                    .into_iter()
                    .collect(),
            ))
            .unwrap();
        let id = row.id().unwrap().as_record().unwrap();
        assert_eq!(id.table(), "task");
        assert!(id.key().starts_with(PENDING_KEY_PREFIX));
    }

    #[test]
    fn normalizes_and_interns_id_fields() {
        let c = collection();
        let row = c
            .validate_insert(Value::Object(
                [
                    ("id".to_owned(), Value::Str("task:1".into())),
                    (
                        "owner".to_owned(),
                        Value::Object(
                            [
                                ("table".to_owned(), Value::Str("user".into())),
                                ("id".to_owned(), Value::Str("7".into())),
                            ]
                            .into_iter()
                            .collect(),
                        ),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .unwrap();

        let id = row.id().unwrap().as_record().unwrap();
        assert!(RecordId::same_ref(
            id,
            &c.identity_cache().intern_str("task:1").unwrap()
        ));
        let owner = row.get("owner").unwrap().as_record().unwrap();
        assert!(RecordId::same_ref(
            owner,
            &c.identity_cache().intern_str("user:7").unwrap()
        ));
    }

    #[test]
    fn get_key_is_canonical() {
        let c = collection();
        let row = Row::new().with("id", "task:⟨1⟩");
        assert_eq!(c.get_key(&row), Some("task:1".to_owned()));
        assert_eq!(c.get_key(&Row::new()), None);
    }

    #[test]
    fn mutations_require_started_sync() {
        let c = collection();
        assert!(matches!(
            c.on_insert(vec![Mutation::insert(Row::new())]),
            Err(SyncError::NotStarted)
        ));
    }
}
