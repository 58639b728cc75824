//! The sync engine: hydration, diffing, live routing, and mutations.

use crate::collection::Mutation;
use crate::config::{CollectionOptions, SyncMode};
use crate::error::{ErrorSink, SyncError, SyncResult};
use crate::host::{SyncSession, WriteOp};
use crate::queue::WorkQueue;
use crate::subset_cache::SubsetCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tidemark_core::crypto::EnvelopeCodec;
use tidemark_core::value::FIELD_ID;
use tidemark_core::{IdentityCache, RecordId, RecordIdInput, Row};
use tidemark_crdt::{LocalChange, Replicator, ReplicatorConfig};
use tidemark_remote::{
    Expr, LiveSubscription, RemoteDatabase, RemoteError, Subset, TableClient, TableEvent,
    TableEventKind, TableTarget,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Key prefix of locally generated temporary ids.
pub const PENDING_KEY_PREFIX: &str = "pending-";

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEngineState {
    /// No sync in progress.
    Idle,
    /// Initial snapshot fetch in progress.
    Hydrating,
    /// Fully hydrated, live stream open.
    ReadyEager,
    /// Ready without hydration; the host drives subset loads.
    ReadyOnDemand,
    /// Ready immediately; hydration pages run in the background.
    ReadyProgressive,
    /// Cleaned up; all events are discarded.
    TornDown,
}

impl SyncEngineState {
    /// True in any of the ready states.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::ReadyEager | Self::ReadyOnDemand | Self::ReadyProgressive
        )
    }

    /// True once the engine is torn down.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TornDown)
    }
}

/// Counters over one engine's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Emission batches closed.
    pub batches_emitted: u64,
    /// Rows surfaced as inserts.
    pub rows_inserted: u64,
    /// Rows surfaced as updates.
    pub rows_updated: u64,
    /// Rows surfaced as deletes.
    pub rows_deleted: u64,
    /// Live events that produced an emission.
    pub live_events_applied: u64,
    /// Live events dropped because they echoed the local actor.
    pub events_dropped_loop: u64,
    /// Live events withheld by the on-demand active-id gate.
    pub events_gated: u64,
    /// Rows or payloads skipped because they failed to decode.
    pub decode_failures: u64,
}

enum DiffScope {
    /// `curr` is the whole table: absent ids become deletes.
    Full,
    /// `curr` is one page or subset: absent ids are left alone.
    Partial,
}

/// One sync instance over one collection.
pub struct SyncEngine<R: RemoteDatabase + 'static> {
    /// Back-reference handed to live callbacks and background threads.
    weak: Weak<SyncEngine<R>>,
    table: TableClient<R>,
    updates_client: Option<TableClient<R>>,
    session: Arc<dyn SyncSession>,
    ids: Arc<IdentityCache>,
    replicator: Option<Replicator<R>>,
    persist_materialized: bool,
    codec: Option<EnvelopeCodec>,
    mode: SyncMode,
    sync_fields: bool,
    page_size: u64,
    state: RwLock<SyncEngineState>,
    prev: Mutex<HashMap<String, Row>>,
    subsets: Mutex<SubsetCache>,
    queue: WorkQueue,
    live: Mutex<Vec<LiveSubscription>>,
    ready_sent: AtomicBool,
    stats: Mutex<SyncStats>,
    on_error: Option<ErrorSink>,
}

impl<R: RemoteDatabase + 'static> SyncEngine<R> {
    /// Builds an engine from collection options and a host session.
    pub fn new(
        options: &CollectionOptions<R>,
        ids: Arc<IdentityCache>,
        session: Arc<dyn SyncSession>,
    ) -> Arc<Self> {
        let codec = options.e2ee.as_ref().map(|e2ee| {
            let codec = EnvelopeCodec::new(Arc::clone(&e2ee.provider));
            match &e2ee.aad {
                Some(aad) => codec.with_aad(aad.clone()),
                None => codec,
            }
        });
        let sync_fields = options.sync_fields_active();

        let table = TableClient::new(Arc::clone(&options.remote), options.table.clone())
            .with_sync_fields(sync_fields);

        let (replicator, updates_client, persist_materialized) = match &options.crdt {
            Some(crdt) => {
                let mut config = ReplicatorConfig::new(
                    options.table.name.clone(),
                    crdt.updates_table.clone(),
                    crdt.actor.clone(),
                )
                .with_profile(crdt.profile);
                if let Some(materialize) = &crdt.materialize {
                    config = config.with_materialize(Arc::clone(materialize));
                }
                if let Some(apply) = &crdt.apply_local_change {
                    config = config.with_apply_change(Arc::clone(apply));
                }
                if let Some(snapshots) = &crdt.snapshots_table {
                    config = config.with_snapshots_table(snapshots.clone());
                }
                if let Some(codec) = &codec {
                    config = config.with_codec(codec.clone());
                }
                let replicator = Replicator::new(
                    Arc::clone(&options.remote),
                    Arc::clone(&crdt.engine),
                    Arc::clone(&ids),
                    config,
                );
                let updates_client = TableClient::new(
                    Arc::clone(&options.remote),
                    TableTarget::new(crdt.updates_table.clone()),
                );
                (
                    Some(replicator),
                    Some(updates_client),
                    crdt.persist_materialized_view,
                )
            }
            None => (None, None, false),
        };

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            table,
            updates_client,
            session,
            ids,
            replicator,
            persist_materialized,
            codec,
            mode: options.sync_mode,
            sync_fields,
            page_size: options.page_size,
            state: RwLock::new(SyncEngineState::Idle),
            prev: Mutex::new(HashMap::new()),
            subsets: Mutex::new(SubsetCache::new()),
            queue: WorkQueue::new(),
            live: Mutex::new(Vec::new()),
            ready_sent: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
            on_error: options.on_error.clone(),
        })
    }

    /// The engine's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SyncEngineState {
        *self.state.read()
    }

    /// A copy of the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, state: SyncEngineState) {
        *self.state.write() = state;
    }

    fn is_torn_down(&self) -> bool {
        self.state().is_terminal()
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_torn_down() {
            Err(SyncError::TornDown)
        } else {
            Ok(())
        }
    }

    fn report(&self, err: &SyncError) {
        warn!(error = %err, "sync error");
        if let Some(sink) = &self.on_error {
            sink(err);
        }
    }

    fn send_ready(&self) {
        if !self.ready_sent.swap(true, Ordering::SeqCst) {
            self.session.mark_ready();
        }
    }

    /// Starts the sync according to the configured mode.
    ///
    /// Remote failures during hydration are reported through the error
    /// sink without tearing the sync down; the engine still reaches a
    /// ready state so the host is never wedged, and later events
    /// reconcile.
    pub fn start(&self) {
        match self.mode {
            SyncMode::Eager => {
                self.set_state(SyncEngineState::Hydrating);
                if let Err(err) = self.queue.run_serial(|| self.hydrate_full()) {
                    self.report(&err);
                }
                self.open_live();
                self.set_state(SyncEngineState::ReadyEager);
                self.send_ready();
            }
            SyncMode::OnDemand => {
                self.set_state(SyncEngineState::ReadyOnDemand);
                self.send_ready();
            }
            SyncMode::Progressive => {
                self.set_state(SyncEngineState::ReadyProgressive);
                self.send_ready();
                if let Some(engine) = self.weak.upgrade() {
                    std::thread::spawn(move || engine.run_progressive_hydration());
                }
            }
        }
    }

    /// Tears the sync down: kills live handles, discards queued work, and
    /// ignores everything that arrives afterwards. Idempotent.
    pub fn cleanup(&self) {
        self.set_state(SyncEngineState::TornDown);
        self.queue.kill();
        let mut live = self.live.lock();
        for subscription in live.iter() {
            subscription.kill();
        }
        live.clear();
    }

    // -- hydration ----------------------------------------------------------

    fn hydrate_full(&self) -> SyncResult<()> {
        let curr = match &self.replicator {
            Some(replicator) => self.hydrate_documents(replicator)?,
            None => {
                let rows = self.table.list_all()?;
                self.index_rows(rows)
            }
        };
        self.emit_diff(curr, DiffScope::Full);
        Ok(())
    }

    fn hydrate_documents(
        &self,
        replicator: &Replicator<R>,
    ) -> SyncResult<HashMap<String, Row>> {
        let mut curr = HashMap::new();
        for id in replicator.discover_doc_ids()? {
            let outcome = replicator.hydrate(&id)?;
            for skipped in outcome.skipped {
                self.bump(|s| s.decode_failures += 1);
                self.report(&skipped.into());
            }
            if !replicator.is_deleted(&id) {
                curr.insert(id.canonical().to_owned(), outcome.view);
            }
        }
        Ok(curr)
    }

    /// Decodes, interns, and keys fetched rows; undecodable rows are
    /// skipped and reported, unidentifiable ones skipped with a log.
    fn index_rows(&self, rows: Vec<Row>) -> HashMap<String, Row> {
        let mut indexed = HashMap::new();
        for row in rows {
            let row = match &self.codec {
                Some(codec) => match codec.decode_base_row(&row) {
                    Ok(row) => row,
                    Err(err) => {
                        self.bump(|s| s.decode_failures += 1);
                        self.report(&err.into());
                        continue;
                    }
                },
                None => row,
            };
            let Some(id) = self.intern_row_id(&row) else {
                debug!("ignoring row without a usable id");
                continue;
            };
            let mut row = row;
            row.set(FIELD_ID, id.clone());
            indexed.insert(id.canonical().to_owned(), row);
        }
        indexed
    }

    fn intern_row_id(&self, row: &Row) -> Option<RecordId> {
        row.id()
            .and_then(RecordIdInput::from_value)
            .and_then(|input| self.ids.intern(&input))
    }

    fn run_progressive_hydration(self: Arc<Self>) {
        let mut offset = 0u64;
        loop {
            if self.is_torn_down() {
                return;
            }
            let page = Subset::all()
                .with_limit(self.page_size)
                .with_offset(offset);
            let rows = match self.table.load_subset(&page) {
                Ok(rows) => rows,
                Err(err) => {
                    self.report(&err.into());
                    break;
                }
            };
            let fetched = rows.len() as u64;
            let curr = self.index_rows(rows);
            self.queue.run_serial(|| self.emit_diff(curr, DiffScope::Partial));
            if fetched < self.page_size {
                break;
            }
            offset += self.page_size;
        }
        self.open_live();
    }

    // -- subsets ------------------------------------------------------------

    /// Loads one subset, records its ids, and emits the delta.
    ///
    /// Translation errors fail the call before any query; the first load
    /// opens the live stream.
    pub fn load_subset(&self, subset: &Subset) -> SyncResult<()> {
        self.ensure_running()?;
        self.queue.run_serial(|| -> SyncResult<()> {
            let rows = self.table.load_subset(subset)?;
            let curr = match &self.replicator {
                Some(replicator) => {
                    let mut curr = HashMap::new();
                    for row in &rows {
                        let Some(id) = self.intern_row_id(row) else {
                            continue;
                        };
                        let outcome = replicator.hydrate(&id)?;
                        for skipped in outcome.skipped {
                            self.bump(|s| s.decode_failures += 1);
                            self.report(&skipped.into());
                        }
                        if !replicator.is_deleted(&id) {
                            curr.insert(id.canonical().to_owned(), outcome.view);
                        }
                    }
                    curr
                }
                None => self.index_rows(rows),
            };
            self.subsets.lock().load(subset, curr.keys().cloned());
            self.emit_diff(curr, DiffScope::Partial);
            Ok(())
        })?;

        if self.live.lock().is_empty() {
            self.open_live();
        }
        Ok(())
    }

    /// Forgets one subset; when it was the last, the live stream closes.
    pub fn unload_subset(&self, subset: &Subset) {
        if self.is_torn_down() {
            return;
        }
        let now_empty = self.subsets.lock().unload(subset);
        if now_empty {
            let mut live = self.live.lock();
            for subscription in live.iter() {
                subscription.kill();
            }
            live.clear();
        }
    }

    // -- diffing ------------------------------------------------------------

    fn differs(&self, a: &Row, b: &Row) -> bool {
        // Sync-field diffing only makes sense for base rows; materialized
        // CRDT views carry no sync fields and compare structurally.
        if self.sync_fields && self.replicator.is_none() {
            !a.sync_fields_equal(b)
        } else {
            !a.equivalent(b)
        }
    }

    fn emit_diff(&self, curr: HashMap<String, Row>, scope: DiffScope) {
        let mut prev = self.prev.lock();

        let mut keys: Vec<&String> = curr.keys().collect();
        keys.sort();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for key in keys {
            let row = &curr[key];
            match prev.get(key) {
                None => inserts.push(WriteOp::Upsert(row.clone())),
                Some(old) if self.differs(old, row) => {
                    updates.push(WriteOp::Upsert(row.clone()));
                }
                Some(_) => {}
            }
        }

        let mut deletes = Vec::new();
        if matches!(scope, DiffScope::Full) {
            let mut gone: Vec<&String> =
                prev.keys().filter(|k| !curr.contains_key(*k)).collect();
            gone.sort();
            for key in gone {
                if let Some(id) = prev
                    .get(key)
                    .and_then(|row| self.intern_row_id(row))
                {
                    deletes.push(WriteOp::Delete(id));
                }
            }
        }

        let counts = (inserts.len(), updates.len(), deletes.len());
        let ops: Vec<WriteOp> = inserts
            .into_iter()
            .chain(updates)
            .chain(deletes)
            .collect();
        self.emit_ops(ops);
        self.bump(|s| {
            s.rows_inserted += counts.0 as u64;
            s.rows_updated += counts.1 as u64;
            s.rows_deleted += counts.2 as u64;
        });

        match scope {
            DiffScope::Full => *prev = curr,
            DiffScope::Partial => {
                for (key, row) in curr {
                    prev.insert(key, row);
                }
            }
        }
    }

    fn emit_ops(&self, ops: Vec<WriteOp>) {
        if self.is_torn_down() {
            return;
        }
        self.session.begin();
        for op in ops {
            self.session.write(op);
        }
        self.session.commit();
        self.bump(|s| s.batches_emitted += 1);
    }

    fn bump(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock());
    }

    // -- live ---------------------------------------------------------------

    fn open_live(&self) {
        if self.is_torn_down() {
            return;
        }
        let result = match &self.updates_client {
            Some(updates) => {
                let weak = self.weak.clone();
                updates.subscribe(move |event| {
                    if let Some(engine) = weak.upgrade() {
                        let job_engine = Arc::clone(&engine);
                        engine
                            .queue
                            .push(move || job_engine.process_log_event(event));
                    }
                })
            }
            None => {
                let weak = self.weak.clone();
                self.table.subscribe(move |event| {
                    if let Some(engine) = weak.upgrade() {
                        let job_engine = Arc::clone(&engine);
                        engine
                            .queue
                            .push(move || job_engine.process_base_event(event));
                    }
                })
            }
        };
        match result {
            Ok(subscription) => self.live.lock().push(subscription),
            Err(RemoteError::LiveUnsupported) => {
                debug!(table = %self.table.table_name(), "live queries unsupported; mutations only");
            }
            Err(err) => self.report(&err.into()),
        }
    }

    fn process_base_event(&self, event: TableEvent) {
        if self.is_torn_down() {
            return;
        }
        let row = match &self.codec {
            Some(codec) => match codec.decode_base_row(&event.row) {
                Ok(row) => row,
                Err(err) => {
                    self.bump(|s| s.decode_failures += 1);
                    self.report(&err.into());
                    return;
                }
            },
            None => event.row,
        };
        let Some(id) = self.intern_row_id(&row) else {
            debug!("ignoring live event without a usable id");
            return;
        };
        let mut row = row;
        row.set(FIELD_ID, id.clone());

        let deleted =
            event.kind == TableEventKind::Delete || (self.sync_fields && row.sync_deleted());
        if deleted {
            self.surface_delete(&id);
        } else {
            self.surface_upsert(&id, row);
        }
    }

    fn process_log_event(&self, event: TableEvent) {
        if self.is_torn_down() {
            return;
        }
        let Some(replicator) = &self.replicator else {
            return;
        };
        // The log is append-only; only row arrivals matter.
        if event.kind == TableEventKind::Delete {
            return;
        }
        match replicator.apply_remote(&event.row) {
            Ok(None) => self.bump(|s| s.events_dropped_loop += 1),
            Ok(Some((id, view))) => {
                if replicator.is_deleted(&id) {
                    self.surface_delete(&id);
                } else {
                    self.surface_upsert(&id, view);
                }
            }
            Err(err) => {
                self.bump(|s| s.decode_failures += 1);
                self.report(&err.into());
            }
        }
    }

    /// Emits a delete. Deletes bypass the on-demand gate so the host can
    /// evict, and the id leaves every subset.
    fn surface_delete(&self, id: &RecordId) {
        self.subsets.lock().evict(id.canonical());
        self.prev.lock().remove(id.canonical());
        self.emit_ops(vec![WriteOp::Delete(id.clone())]);
        self.bump(|s| {
            s.rows_deleted += 1;
            s.live_events_applied += 1;
        });
    }

    fn surface_upsert(&self, id: &RecordId, row: Row) {
        if self.mode == SyncMode::OnDemand && !self.subsets.lock().is_active(id.canonical()) {
            self.bump(|s| s.events_gated += 1);
            return;
        }
        {
            let mut prev = self.prev.lock();
            if let Some(old) = prev.get(id.canonical()) {
                if !self.differs(old, &row) {
                    return;
                }
            }
            prev.insert(id.canonical().to_owned(), row.clone());
        }
        self.emit_ops(vec![WriteOp::Upsert(row)]);
        self.bump(|s| s.live_events_applied += 1);
    }

    // -- mutations ----------------------------------------------------------

    /// Handles host-side inserts: optimistic upsert, then persistence.
    pub fn apply_insert(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.ensure_running()?;
        self.queue.run_serial(|| -> SyncResult<()> {
            for mutation in mutations {
                let mut row = mutation.data;
                let id = match self.mutation_id(mutation.key.as_deref(), &row) {
                    Some(id) => id,
                    None => self.generate_pending_id()?,
                };
                row.set(FIELD_ID, id.clone());

                self.optimistic_upsert(&id, row.clone());

                match &self.replicator {
                    Some(replicator) => {
                        let view = replicator
                            .commit_local_change(&id, &LocalChange::Insert(row))?;
                        self.mirror_materialized(replicator, &view, &id);
                        self.optimistic_upsert(&id, view);
                    }
                    None => {
                        let stored = match &self.codec {
                            Some(codec) => codec.encode_base_row(&row, &id)?,
                            None => row,
                        };
                        self.table.create(stored)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Handles host-side updates.
    ///
    /// Without CRDT but with E2EE, the current ciphertext is read,
    /// decrypted, merged, and re-encrypted (the remote cannot merge inside
    /// an envelope).
    pub fn apply_update(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.ensure_running()?;
        self.queue.run_serial(|| -> SyncResult<()> {
            for mutation in mutations {
                let patch = mutation.data;
                let id = self
                    .mutation_id(mutation.key.as_deref(), &patch)
                    .ok_or(SyncError::MissingKey)?;

                let mut merged = self
                    .prev
                    .lock()
                    .get(id.canonical())
                    .cloned()
                    .unwrap_or_else(|| Row::new().with(FIELD_ID, id.clone()));
                merged.merge(patch.clone());
                merged.set(FIELD_ID, id.clone());
                self.optimistic_upsert(&id, merged);

                match &self.replicator {
                    Some(replicator) => {
                        let view = replicator
                            .commit_local_change(&id, &LocalChange::Update(patch))?;
                        self.mirror_materialized(replicator, &view, &id);
                        self.optimistic_upsert(&id, view);
                    }
                    None => match &self.codec {
                        Some(codec) => {
                            let current = self.fetch_row(&id)?;
                            let mut plain = match current {
                                Some(row) => codec.decode_base_row(&row)?,
                                None => Row::new().with(FIELD_ID, id.clone()),
                            };
                            plain.merge(patch);
                            let encoded = codec.encode_base_row(&plain, &id)?;
                            self.table.update(&id, encoded)?;
                        }
                        None => {
                            self.table.update(&id, patch)?;
                        }
                    },
                }
            }
            Ok(())
        })
    }

    /// Handles host-side deletes.
    pub fn apply_delete(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.ensure_running()?;
        self.queue.run_serial(|| -> SyncResult<()> {
            for mutation in mutations {
                let id = self
                    .mutation_id(mutation.key.as_deref(), &mutation.data)
                    .ok_or(SyncError::MissingKey)?;

                self.subsets.lock().evict(id.canonical());
                self.prev.lock().remove(id.canonical());
                self.emit_ops(vec![WriteOp::Delete(id.clone())]);
                self.bump(|s| s.rows_deleted += 1);

                match &self.replicator {
                    Some(replicator) => {
                        let view =
                            replicator.commit_local_change(&id, &LocalChange::Delete)?;
                        self.mirror_materialized(replicator, &view, &id);
                    }
                    None => self.table.soft_delete(&id)?,
                }
            }
            Ok(())
        })
    }

    fn mutation_id(&self, key: Option<&str>, row: &Row) -> Option<RecordId> {
        if let Some(key) = key {
            if let Some(id) = self.ids.intern_str(key) {
                return Some(id);
            }
            // A bare key names a record on this collection's table.
            if let Some(id) = self.ids.intern_parts(self.table.table_name(), key) {
                return Some(id);
            }
        }
        self.intern_row_id(row)
    }

    fn generate_pending_id(&self) -> SyncResult<RecordId> {
        let key = format!("{PENDING_KEY_PREFIX}{}", Uuid::new_v4().simple());
        self.ids
            .intern_parts(self.table.table_name(), &key)
            .ok_or(SyncError::MissingKey)
    }

    fn optimistic_upsert(&self, id: &RecordId, row: Row) {
        self.prev
            .lock()
            .insert(id.canonical().to_owned(), row.clone());
        self.emit_ops(vec![WriteOp::Upsert(row)]);
    }

    fn mirror_materialized(&self, replicator: &Replicator<R>, view: &Row, id: &RecordId) {
        if !self.persist_materialized {
            return;
        }
        // Best-effort: the update row is already durable; a failed mirror
        // is reported and retried by the next materialization.
        if let Err(err) = replicator.persist_materialized(view, id) {
            self.report(&err.into());
        }
    }

    fn fetch_row(&self, id: &RecordId) -> SyncResult<Option<Row>> {
        let subset =
            Subset::all().with_filter(Expr::eq(FIELD_ID, tidemark_core::Value::Record(id.clone())));
        let rows = self.table.load_subset(&subset)?;
        Ok(rows.into_iter().next())
    }
}

impl<R: RemoteDatabase + 'static> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("tracked_rows", &self.prev.lock().len())
            .finish()
    }
}
