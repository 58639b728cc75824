//! The query-shaped surface over one remote table.

use crate::builder::{build_select, BuildOptions};
use crate::client::{coerce_id, LiveAction, LiveHandle, RemoteDatabase};
use crate::error::{RemoteError, RemoteResult};
use crate::expr::Subset;
use chrono::Utc;
use std::sync::Arc;
use tidemark_core::value::{FIELD_SYNC_DELETED, FIELD_UPDATED_AT};
use tidemark_core::{RecordId, Row};
use tracing::debug;

/// The table a client operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    /// Table name.
    pub name: String,
    /// True for edge-relation tables (`from`/`to` map to `in`/`out`).
    pub relation: bool,
}

impl TableTarget {
    /// A plain document table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relation: false,
        }
    }

    /// An edge-relation table.
    pub fn relation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relation: true,
        }
    }
}

/// A typed change event from a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEventKind {
    /// Row created.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// One live change on a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEvent {
    /// What happened.
    pub kind: TableEventKind,
    /// The affected row.
    pub row: Row,
}

/// A cancellation handle for one live subscription.
#[derive(Clone)]
pub struct LiveSubscription {
    handle: Arc<dyn LiveHandle>,
}

impl LiveSubscription {
    /// Kills the subscription; safe to call more than once.
    pub fn kill(&self) {
        self.handle.kill();
    }

    /// True once the subscription is dead.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.handle.is_killed()
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// A thin, query-shaped client for one table.
#[derive(Clone)]
pub struct TableClient<R: RemoteDatabase> {
    remote: Arc<R>,
    table: TableTarget,
    sync_fields: bool,
}

impl<R: RemoteDatabase> TableClient<R> {
    /// Creates a client without sync-field semantics.
    pub fn new(remote: Arc<R>, table: TableTarget) -> Self {
        Self {
            remote,
            table,
            sync_fields: false,
        }
    }

    /// Enables sync-field semantics: list/subset queries filter tombstones
    /// and writes stamp `sync_deleted`/`updated_at`.
    #[must_use]
    pub fn with_sync_fields(mut self, enabled: bool) -> Self {
        self.sync_fields = enabled;
        self
    }

    /// The target table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// The underlying remote handle.
    #[must_use]
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            sync_filtered: self.sync_fields,
            edge_relation: self.table.relation,
        }
    }

    /// Fetches every (non-tombstoned) row.
    pub fn list_all(&self) -> RemoteResult<Vec<Row>> {
        if !self.sync_fields {
            return self.remote.select(&self.table.name);
        }
        self.load_subset(&Subset::all())
    }

    /// Fetches one subset of the table.
    pub fn load_subset(&self, subset: &Subset) -> RemoteResult<Vec<Row>> {
        let query = build_select(&self.table.name, subset, self.build_options())?;
        let results = self.remote.query(&query.sql, &query.bindings)?;
        Ok(first_statement_rows(results))
    }

    /// Runs a prebuilt query, coercing null statements to empty row sets.
    pub fn run(&self, query: &crate::builder::BuiltQuery) -> RemoteResult<Vec<Row>> {
        let results = self.remote.query(&query.sql, &query.bindings)?;
        Ok(first_statement_rows(results))
    }

    /// Persists a new row.
    ///
    /// With an `id` present the id is coerced to `(table, key)` and a typed
    /// insert runs; without one the remote generates the id. Returns the
    /// persisted row.
    pub fn create(&self, row: Row) -> RemoteResult<Row> {
        match row.id() {
            Some(id_value) => {
                let id = coerce_id(&self.table.name, id_value).ok_or(RemoteError::MissingId)?;
                let mut row = row;
                row.set("id", id);
                self.remote.insert(&self.table.name, row)
            }
            None => self.remote.create(&self.table.name, row),
        }
    }

    /// Merges fields into an existing row.
    ///
    /// In sync-field mode the write also clears the tombstone and stamps
    /// `updated_at`, so an update doubles as an undelete.
    pub fn update(&self, id: &RecordId, patch: Row) -> RemoteResult<Option<Row>> {
        let mut patch = patch;
        if self.sync_fields {
            patch.set(FIELD_SYNC_DELETED, false);
            patch.set(FIELD_UPDATED_AT, Utc::now());
        }
        self.remote.update_merge(id, patch)
    }

    /// Merges fields, creating the row when absent.
    pub fn upsert(&self, id: &RecordId, patch: Row) -> RemoteResult<Row> {
        self.remote.upsert_merge(id, patch)
    }

    /// Deletes a row: a tombstone merge in sync-field mode, a hard delete
    /// otherwise.
    pub fn soft_delete(&self, id: &RecordId) -> RemoteResult<()> {
        if self.sync_fields {
            let tombstone = Row::new()
                .with(FIELD_SYNC_DELETED, true)
                .with(FIELD_UPDATED_AT, Utc::now());
            self.remote.update_merge(id, tombstone)?;
            Ok(())
        } else {
            self.remote.delete(id)
        }
    }

    /// Opens a live subscription, delivering typed insert/update/delete
    /// events. `KILLED` terminates the handle and is not forwarded.
    pub fn subscribe<F>(&self, callback: F) -> RemoteResult<LiveSubscription>
    where
        F: Fn(TableEvent) + Send + Sync + 'static,
    {
        let handle = self.remote.live(&self.table.name)?;
        let table = self.table.name.clone();
        // Weak, so the callback does not keep its own handle alive.
        let dead = Arc::downgrade(&handle);
        handle.subscribe(Arc::new(move |notification| {
            let kind = match notification.action {
                LiveAction::Create => TableEventKind::Insert,
                LiveAction::Update => TableEventKind::Update,
                LiveAction::Delete => TableEventKind::Delete,
                LiveAction::Killed => {
                    debug!(table = %table, "live subscription killed");
                    if let Some(handle) = dead.upgrade() {
                        handle.kill();
                    }
                    return;
                }
            };
            callback(TableEvent {
                kind,
                row: notification.value,
            });
        }));
        Ok(LiveSubscription { handle })
    }
}

fn first_statement_rows(results: Vec<Option<Vec<Row>>>) -> Vec<Row> {
    results.into_iter().next().flatten().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LiveNotification, MemoryRemote};
    use parking_lot::Mutex;
    use tidemark_core::Value;

    fn client(sync_fields: bool) -> (Arc<MemoryRemote>, TableClient<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let client = TableClient::new(Arc::clone(&remote), TableTarget::new("task"))
            .with_sync_fields(sync_fields);
        (remote, client)
    }

    #[test]
    fn list_all_plain() {
        let (remote, client) = client(false);
        remote.seed("task", Row::new().with("id", "task:1"));
        assert_eq!(client.list_all().unwrap().len(), 1);
    }

    #[test]
    fn list_all_filters_tombstones() {
        let (remote, client) = client(true);
        remote.seed(
            "task",
            Row::new().with("id", "task:1").with(FIELD_SYNC_DELETED, false),
        );
        remote.seed(
            "task",
            Row::new().with("id", "task:2").with(FIELD_SYNC_DELETED, true),
        );
        // Rows with no tombstone column at all also survive the filter.
        remote.seed("task", Row::new().with("id", "task:3"));

        let rows = client.list_all().unwrap();
        let keys: Vec<&str> = rows
            .iter()
            .map(|r| r.id().unwrap().as_record().unwrap().key())
            .collect();
        assert_eq!(keys, ["1", "3"]);
    }

    #[test]
    fn create_with_id_is_typed() {
        let (remote, client) = client(false);
        let row = client
            .create(Row::new().with("id", "seed-1").with("title", "Seed"))
            .unwrap();
        assert_eq!(
            row.id().unwrap().as_record().unwrap().canonical(),
            "task:seed-1"
        );
        assert!(remote.stored("task", "task:seed-1").is_some());
    }

    #[test]
    fn create_without_id_generates() {
        let (remote, client) = client(false);
        let row = client.create(Row::new().with("title", "x")).unwrap();
        assert!(row.id().is_some());
        assert_eq!(remote.row_count("task"), 1);
    }

    #[test]
    fn update_stamps_sync_fields() {
        let (remote, client) = client(true);
        remote.seed(
            "task",
            Row::new().with("id", "task:1").with(FIELD_SYNC_DELETED, true),
        );
        let id = RecordId::parse("task:1").unwrap();
        let updated = client
            .update(&id, Row::new().with("title", "back"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.get(FIELD_SYNC_DELETED), Some(&Value::Bool(false)));
        assert!(updated.get(FIELD_UPDATED_AT).is_some());
    }

    #[test]
    fn soft_delete_merges_tombstone() {
        let (remote, client) = client(true);
        remote.seed("task", Row::new().with("id", "task:1"));
        let id = RecordId::parse("task:1").unwrap();
        client.soft_delete(&id).unwrap();

        let stored = remote.stored("task", "task:1").unwrap();
        assert!(stored.sync_deleted());
        assert_eq!(remote.row_count("task"), 1);
    }

    #[test]
    fn hard_delete_removes() {
        let (remote, client) = client(false);
        remote.seed("task", Row::new().with("id", "task:1"));
        client.soft_delete(&RecordId::parse("task:1").unwrap()).unwrap();
        assert_eq!(remote.row_count("task"), 0);
    }

    #[test]
    fn subscribe_types_events_and_drops_killed() {
        let (remote, client) = client(false);
        let seen: Arc<Mutex<Vec<TableEvent>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let sub = client.subscribe(move |e| sink.lock().push(e)).unwrap();

        remote
            .create("task", Row::new().with("id", "task:1"))
            .unwrap();
        remote.notify(
            "task",
            LiveNotification {
                action: LiveAction::Killed,
                value: Row::new(),
            },
        );
        // The KILLED notification terminated the handle.
        assert!(sub.is_killed());
        remote
            .create("task", Row::new().with("id", "task:2"))
            .unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TableEventKind::Insert);
    }

    #[test]
    fn kill_is_idempotent() {
        let (_remote, client) = client(false);
        let sub = client.subscribe(|_| {}).unwrap();
        assert!(!sub.is_killed());
        sub.kill();
        sub.kill();
        assert!(sub.is_killed());
    }
}
