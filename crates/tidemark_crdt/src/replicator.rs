//! Per-document replication over an append-only update log.

use crate::engine::{CrdtDoc, CrdtEngine};
use crate::error::{CrdtError, CrdtResult};
use crate::profile::{LocalChange, Profile};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tidemark_core::crypto::{encode_plain_payload, decode_plain_payload, EnvelopeCodec, LogKind};
use tidemark_core::{IdentityCache, RecordId, RecordIdInput, Row, Value};
use tidemark_remote::builder::{build_doc_index, build_latest_snapshot, build_log_replay};
use tidemark_remote::{RemoteDatabase, RemoteResult};
use tracing::debug;

/// Resolves the local actor identity for a write.
#[derive(Clone)]
pub enum ActorResolver {
    /// One fixed identity for every document.
    Fixed(String),
    /// Identity as a function of the document and the change being made
    /// (`None` outside a write, e.g. when filtering incoming events).
    Resolver(Arc<dyn Fn(&RecordId, Option<&LocalChange>) -> String + Send + Sync>),
}

impl ActorResolver {
    /// Resolves the identity for one document.
    #[must_use]
    pub fn resolve(&self, id: &RecordId, change: Option<&LocalChange>) -> String {
        match self {
            ActorResolver::Fixed(actor) => actor.clone(),
            ActorResolver::Resolver(resolve) => resolve(id, change),
        }
    }
}

impl From<&str> for ActorResolver {
    fn from(actor: &str) -> Self {
        ActorResolver::Fixed(actor.to_owned())
    }
}

impl From<String> for ActorResolver {
    fn from(actor: String) -> Self {
        ActorResolver::Fixed(actor)
    }
}

impl fmt::Debug for ActorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorResolver::Fixed(actor) => write!(f, "ActorResolver::Fixed({actor:?})"),
            ActorResolver::Resolver(_) => f.write_str("ActorResolver::Resolver(..)"),
        }
    }
}

/// Custom projection of a document into a row.
pub type MaterializeFn = Arc<dyn Fn(&dyn CrdtDoc, &RecordId) -> Row + Send + Sync>;
/// Custom folding of a local change into a document.
pub type ApplyChangeFn = Arc<dyn Fn(&mut dyn CrdtDoc, &LocalChange) + Send + Sync>;

/// Static configuration of a [`Replicator`].
#[derive(Clone)]
pub struct ReplicatorConfig {
    /// Base table the documents mirror.
    pub base_table: String,
    /// Append-only update-log table.
    pub updates_table: String,
    /// Optional snapshot table for compaction.
    pub snapshots_table: Option<String>,
    /// Materialization profile.
    pub profile: Profile,
    /// Overrides the profile's projection.
    pub materialize: Option<MaterializeFn>,
    /// Overrides the profile's change folding.
    pub apply_change: Option<ApplyChangeFn>,
    /// Local actor identity.
    pub actor: ActorResolver,
    /// Envelope codec when the log is end-to-end encrypted.
    pub codec: Option<EnvelopeCodec>,
}

impl fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("base_table", &self.base_table)
            .field("updates_table", &self.updates_table)
            .field("snapshots_table", &self.snapshots_table)
            .field("profile", &self.profile)
            .field("materialize", &self.materialize.as_ref().map(|_| ".."))
            .field("apply_change", &self.apply_change.as_ref().map(|_| ".."))
            .field("actor", &self.actor)
            .field("codec", &self.codec)
            .finish()
    }
}

impl ReplicatorConfig {
    /// Creates a config with the json profile and no encryption.
    pub fn new(
        base_table: impl Into<String>,
        updates_table: impl Into<String>,
        actor: impl Into<ActorResolver>,
    ) -> Self {
        Self {
            base_table: base_table.into(),
            updates_table: updates_table.into(),
            snapshots_table: None,
            profile: Profile::Json,
            materialize: None,
            apply_change: None,
            actor: actor.into(),
            codec: None,
        }
    }

    /// Builder: sets the snapshot table.
    #[must_use]
    pub fn with_snapshots_table(mut self, table: impl Into<String>) -> Self {
        self.snapshots_table = Some(table.into());
        self
    }

    /// Builder: sets the profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Builder: overrides the profile's projection.
    #[must_use]
    pub fn with_materialize(mut self, materialize: MaterializeFn) -> Self {
        self.materialize = Some(materialize);
        self
    }

    /// Builder: overrides the profile's change folding.
    #[must_use]
    pub fn with_apply_change(mut self, apply_change: ApplyChangeFn) -> Self {
        self.apply_change = Some(apply_change);
        self
    }

    /// Builder: encrypts log payloads with the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = Some(codec);
        self
    }
}

/// What a hydration produced.
#[derive(Debug)]
pub struct HydrateOutcome {
    /// The materialized view after replay.
    pub view: Row,
    /// Log rows that failed to decode and were skipped.
    pub skipped: Vec<CrdtError>,
}

/// Maintains per-document CRDT state and its persistence.
///
/// One document per base-row id, created lazily. Documents persist only
/// through the update log (and optional snapshots); the in-memory map is a
/// cache that any client can rebuild with [`hydrate`](Self::hydrate).
pub struct Replicator<R: RemoteDatabase> {
    remote: Arc<R>,
    engine: Arc<dyn CrdtEngine>,
    ids: Arc<IdentityCache>,
    config: ReplicatorConfig,
    docs: Mutex<HashMap<String, Box<dyn CrdtDoc>>>,
}

impl<R: RemoteDatabase> Replicator<R> {
    /// Creates a replicator.
    pub fn new(
        remote: Arc<R>,
        engine: Arc<dyn CrdtEngine>,
        ids: Arc<IdentityCache>,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            remote,
            engine,
            ids,
            config,
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// The replicator's configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    fn project(&self, doc: &dyn CrdtDoc, id: &RecordId) -> Row {
        match &self.config.materialize {
            Some(materialize) => materialize(doc, id),
            None => self.config.profile.materialize(doc, id),
        }
    }

    fn fold(&self, doc: &mut dyn CrdtDoc, change: &LocalChange) {
        match &self.config.apply_change {
            Some(apply_change) => apply_change(doc, change),
            None => self.config.profile.apply_local_change(doc, change),
        }
    }

    /// Runs `f` against the document for `id`, creating it on first access.
    ///
    /// The remote is never called while the document map is locked; callers
    /// that persist do so after this returns.
    fn with_doc<T>(&self, id: &RecordId, f: impl FnOnce(&mut dyn CrdtDoc) -> T) -> T {
        let mut docs = self.docs.lock();
        let doc = docs.entry(id.canonical().to_owned()).or_insert_with(|| {
            self.engine
                .create_doc(&self.config.actor.resolve(id, None))
        });
        f(doc.as_mut())
    }

    /// Folds a local change into the document and appends the resulting
    /// incremental update to the log.
    ///
    /// Returns the re-materialized view. The captured version makes the
    /// exported update exactly the delta this change produced.
    pub fn commit_local_change(&self, id: &RecordId, change: &LocalChange) -> CrdtResult<Row> {
        let actor = self.config.actor.resolve(id, Some(change));
        let (bytes, view) = self.with_doc(id, |doc| -> CrdtResult<(Vec<u8>, Row)> {
            let from = doc.version();
            doc.set_actor(&actor);
            self.fold(doc, change);
            let bytes = doc.export_update(Some(&from))?;
            Ok((bytes, self.project(doc, id)))
        })?;
        self.persist_update(id, &bytes, &actor)?;
        Ok(view)
    }

    /// Appends one update row: `{doc, ts, actor}` plus the payload, either
    /// plaintext `update_bytes` or envelope fields under E2EE.
    pub fn persist_update(&self, id: &RecordId, bytes: &[u8], actor: &str) -> CrdtResult<Row> {
        let mut row = Row::new()
            .with("doc", id.clone())
            .with("ts", Utc::now())
            .with("actor", actor);
        match &self.config.codec {
            Some(codec) => {
                let envelope =
                    codec.encode_update(bytes, &self.config.updates_table, id, LogKind::Update)?;
                row.merge(envelope);
            }
            None => encode_plain_payload(&mut row, bytes, LogKind::Update),
        }
        Ok(self.remote.create(&self.config.updates_table, row)?)
    }

    /// Exports and persists a snapshot of the document, bounding future
    /// log replay. Best-effort compaction; the update log stays intact.
    pub fn persist_snapshot(&self, id: &RecordId) -> CrdtResult<Row> {
        let table = self
            .config
            .snapshots_table
            .clone()
            .ok_or(CrdtError::SnapshotsUnconfigured)?;
        let bytes = self.with_doc(id, |doc| doc.export_snapshot())?;
        let mut row = Row::new().with("doc", id.clone()).with("ts", Utc::now());
        match &self.config.codec {
            Some(codec) => {
                let envelope = codec.encode_update(&bytes, &table, id, LogKind::Snapshot)?;
                row.merge(envelope);
            }
            None => encode_plain_payload(&mut row, &bytes, LogKind::Snapshot),
        }
        Ok(self.remote.create(&table, row)?)
    }

    /// Rebuilds the document from the newest snapshot (if any) plus every
    /// later update, in ascending `ts` order.
    ///
    /// Rows that fail to decode are skipped and reported in the outcome;
    /// one bad row never aborts the replay.
    pub fn hydrate(&self, id: &RecordId) -> CrdtResult<HydrateOutcome> {
        let mut skipped = Vec::new();
        let mut after: Option<Value> = None;
        let mut imports: Vec<Vec<u8>> = Vec::new();

        if let Some(snapshot_table) = &self.config.snapshots_table {
            let query = build_latest_snapshot(snapshot_table, Value::Record(id.clone()));
            let rows = flatten(self.remote.query(&query.sql, &query.bindings))?;
            if let Some(row) = rows.into_iter().next() {
                match self.decode_payload(&row, snapshot_table, LogKind::Snapshot) {
                    Ok(bytes) => {
                        after = row.get("ts").cloned();
                        imports.push(bytes);
                    }
                    Err(err) => skipped.push(err),
                }
            }
        }

        let query = build_log_replay(
            &self.config.updates_table,
            Value::Record(id.clone()),
            after,
        );
        let rows = flatten(self.remote.query(&query.sql, &query.bindings))?;
        for row in rows {
            match self.decode_payload(&row, &self.config.updates_table, LogKind::Update) {
                Ok(bytes) => imports.push(bytes),
                Err(err) => skipped.push(err),
            }
        }

        let view = self.with_doc(id, |doc| -> CrdtResult<Row> {
            for bytes in &imports {
                doc.import(bytes)?;
            }
            Ok(self.project(doc, id))
        })?;

        Ok(HydrateOutcome { view, skipped })
    }

    /// Routes one incoming update-log row into its document.
    ///
    /// Rows whose `actor` equals the local actor for that document are
    /// dropped without importing, so locally appended updates do not echo
    /// back through the live stream. Returns the affected id and fresh
    /// view otherwise.
    pub fn apply_remote(&self, row: &Row) -> CrdtResult<Option<(RecordId, Row)>> {
        let id = row
            .get("doc")
            .and_then(RecordIdInput::from_value)
            .and_then(|input| self.ids.intern(&input))
            .ok_or(CrdtError::MissingDocId)?;

        let local = self.config.actor.resolve(&id, None);
        if row.get("actor").and_then(Value::as_str) == Some(local.as_str()) {
            debug!(doc = %id, actor = %local, "dropping own update echo");
            return Ok(None);
        }

        let bytes = self.decode_payload(row, &self.config.updates_table, LogKind::Update)?;
        let view = self.with_doc(&id, |doc| -> CrdtResult<Row> {
            doc.import(&bytes)?;
            Ok(self.project(doc, &id))
        })?;
        Ok(Some((id, view)))
    }

    /// The document's current projection.
    #[must_use]
    pub fn materialized_view(&self, id: &RecordId) -> Row {
        self.with_doc(id, |doc| self.project(doc, id))
    }

    /// True once a delete change has reached the document.
    #[must_use]
    pub fn is_deleted(&self, id: &RecordId) -> bool {
        self.with_doc(id, |doc| self.config.profile.is_deleted(doc))
    }

    /// Upserts the base-table mirror of a materialized view.
    pub fn persist_materialized(&self, view: &Row, id: &RecordId) -> CrdtResult<Row> {
        let patch = match &self.config.codec {
            Some(codec) => codec.encode_base_row(view, id)?,
            None => view.clone(),
        };
        Ok(self.remote.upsert_merge(id, patch)?)
    }

    /// Lists every document id present in the update log.
    pub fn discover_doc_ids(&self) -> CrdtResult<Vec<RecordId>> {
        let query = build_doc_index(&self.config.updates_table);
        let rows = flatten(self.remote.query(&query.sql, &query.bindings))?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                row.get("doc")
                    .and_then(RecordIdInput::from_value)
                    .and_then(|input| self.ids.intern(&input))
            })
            .collect())
    }

    fn decode_payload(&self, row: &Row, table: &str, kind: LogKind) -> CrdtResult<Vec<u8>> {
        match &self.config.codec {
            Some(codec) => Ok(codec.decode_update(row, table, kind)?),
            None => Ok(decode_plain_payload(row, kind)?),
        }
    }
}

impl<R: RemoteDatabase> fmt::Debug for Replicator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("config", &self.config)
            .field("docs", &self.docs.lock().len())
            .finish()
    }
}

fn flatten(results: RemoteResult<Vec<Option<Vec<Row>>>>) -> CrdtResult<Vec<Row>> {
    Ok(results?.into_iter().next().flatten().unwrap_or_default())
}
