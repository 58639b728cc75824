//! The remote database capability and an in-memory implementation.

use crate::error::{RemoteError, RemoteResult};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tidemark_core::{RecordId, RecordIdInput, Row, Value};
use uuid::Uuid;

/// Action carried by a live notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAction {
    /// A row was created.
    Create,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
    /// The subscription was killed server-side.
    Killed,
}

/// One push message from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveNotification {
    /// What happened.
    pub action: LiveAction,
    /// The affected row (the deleted row for `Delete`, empty for `Killed`).
    pub value: Row,
}

/// Callback invoked for each live notification.
pub type LiveCallback = Arc<dyn Fn(LiveNotification) + Send + Sync>;

/// A handle on one live subscription.
pub trait LiveHandle: Send + Sync {
    /// Registers a callback for future notifications.
    fn subscribe(&self, callback: LiveCallback);

    /// Kills the subscription. Idempotent; later notifications are dropped.
    fn kill(&self);

    /// True once [`kill`](Self::kill) has run (locally or server-side).
    fn is_killed(&self) -> bool;
}

/// The remote database capability consumed by the sync engine.
///
/// Implementations are assumed safe for concurrent callers. Every method
/// maps onto one request against the remote.
pub trait RemoteDatabase: Send + Sync {
    /// Fetches every row of a table.
    fn select(&self, table: &str) -> RemoteResult<Vec<Row>>;

    /// Runs a parameterized query; one result list per statement, `None`
    /// where the remote returned null.
    fn query(
        &self,
        sql: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> RemoteResult<Vec<Option<Vec<Row>>>>;

    /// Creates a row, generating an id when `content` has none; returns
    /// the persisted row.
    fn create(&self, table: &str, content: Row) -> RemoteResult<Row>;

    /// Inserts a row under the id carried in `content`.
    fn insert(&self, table: &str, content: Row) -> RemoteResult<Row>;

    /// Merges fields into an existing row; `None` when the row is absent.
    fn update_merge(&self, id: &RecordId, patch: Row) -> RemoteResult<Option<Row>>;

    /// Merges fields, creating the row when absent.
    fn upsert_merge(&self, id: &RecordId, patch: Row) -> RemoteResult<Row>;

    /// Hard-deletes a row; absent rows are not an error.
    fn delete(&self, id: &RecordId) -> RemoteResult<()>;

    /// Opens a live subscription on a table.
    fn live(&self, table: &str) -> RemoteResult<Arc<dyn LiveHandle>>;

    /// True when the remote can serve live queries.
    fn supports_live_queries(&self) -> bool;
}

/// Coerces a row id (canonical string, bare key, parts object, or typed
/// record) into a record id on `table`.
pub fn coerce_id(table: &str, id: &Value) -> Option<RecordId> {
    if let Some(canonical) = RecordIdInput::from_value(id).and_then(|i| i.to_canonical_string()) {
        if let Some((t, key)) = canonical.split_once(':') {
            if t == table {
                return RecordId::from_parts(t, key);
            }
            // A fully-qualified id naming another table is taken as-is.
            return RecordId::from_parts(t, key);
        }
    }
    match id {
        Value::Str(key) => RecordId::from_parts(table, key),
        Value::Int(key) => RecordId::from_parts(table, &key.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// In-memory remote
// ---------------------------------------------------------------------------

struct MemoryLive {
    killed: AtomicBool,
    subscribers: Mutex<Vec<LiveCallback>>,
}

impl MemoryLive {
    fn new() -> Self {
        Self {
            killed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, notification: LiveNotification) {
        if self.killed.load(AtomicOrdering::SeqCst) {
            return;
        }
        for callback in self.subscribers.lock().iter() {
            callback(notification.clone());
        }
    }
}

impl LiveHandle for MemoryLive {
    fn subscribe(&self, callback: LiveCallback) {
        self.subscribers.lock().push(callback);
    }

    fn kill(&self) {
        if !self.killed.swap(true, AtomicOrdering::SeqCst) {
            for callback in self.subscribers.lock().iter() {
                callback(LiveNotification {
                    action: LiveAction::Killed,
                    value: Row::new(),
                });
            }
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(AtomicOrdering::SeqCst)
    }
}

/// An in-memory remote with real table state and live channels.
///
/// Mutations behave like the real remote (create/insert/merge/delete emit
/// live notifications); `query` evaluates the statement shapes this
/// workspace's builder emits: flat `AND` filters of comparisons, ordering,
/// `LIMIT`/`START`, and single-field `GROUP BY` projections. Anything
/// fancier returns a query error, which keeps the evaluator honest about
/// what it understands.
#[derive(Default)]
pub struct MemoryRemote {
    tables: RwLock<HashMap<String, BTreeMap<String, Row>>>,
    feeds: RwLock<HashMap<String, Vec<Arc<MemoryLive>>>>,
    live_disabled: AtomicBool,
}

impl MemoryRemote {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles live-query support (protocol-fallback testing).
    pub fn set_live_supported(&self, supported: bool) {
        self.live_disabled
            .store(!supported, AtomicOrdering::SeqCst);
    }

    /// Seeds a row without emitting live notifications.
    pub fn seed(&self, table: &str, row: Row) {
        if let Some(id) = row.id().and_then(|v| coerce_id(table, v)) {
            let mut row = row;
            row.set("id", id.clone());
            self.tables
                .write()
                .entry(table.to_owned())
                .or_default()
                .insert(id.canonical().to_owned(), row);
        }
    }

    /// Injects a live notification without touching table state.
    ///
    /// Simulates server-side events (other clients, malformed messages)
    /// that have no local mutation counterpart.
    pub fn notify(&self, table: &str, notification: LiveNotification) {
        let feeds = self.feeds.read();
        if let Some(handles) = feeds.get(table) {
            for handle in handles {
                handle.emit(notification.clone());
            }
        }
    }

    /// Number of rows currently stored in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Returns a stored row by canonical id.
    #[must_use]
    pub fn stored(&self, table: &str, canonical: &str) -> Option<Row> {
        self.tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(canonical))
            .cloned()
    }

    /// All stored rows of a table in key order.
    #[must_use]
    pub fn stored_rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn emit_live(&self, table: &str, action: LiveAction, value: Row) {
        let mut feeds = self.feeds.write();
        if let Some(handles) = feeds.get_mut(table) {
            handles.retain(|h| !h.is_killed());
            for handle in handles.iter() {
                handle.emit(LiveNotification {
                    action,
                    value: value.clone(),
                });
            }
        }
    }

    fn store(&self, table: &str, id: &RecordId, row: Row) -> (Row, bool) {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_owned()).or_default();
        let mut row = row;
        row.set("id", id.clone());
        let existed = rows
            .insert(id.canonical().to_owned(), row.clone())
            .is_some();
        (row, existed)
    }
}

impl RemoteDatabase for MemoryRemote {
    fn select(&self, table: &str) -> RemoteResult<Vec<Row>> {
        Ok(self.stored_rows(table))
    }

    fn query(
        &self,
        sql: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> RemoteResult<Vec<Option<Vec<Row>>>> {
        let statement = parse_statement(sql)?;
        let mut rows: Vec<Row> = self.stored_rows(&statement.table);
        rows.retain(|row| statement.matches(row, bindings));

        if !statement.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for (field, descending) in &statement.order_by {
                    let lhs = a.get(field);
                    let rhs = b.get(field);
                    let ord = order_optional(lhs, rhs);
                    let ord = if *descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(start) = statement.start {
            rows = rows.into_iter().skip(start as usize).collect();
        }
        if let Some(limit) = statement.limit {
            rows.truncate(limit as usize);
        }

        if let Some(field) = &statement.group_by {
            let mut seen = Vec::new();
            let mut grouped = Vec::new();
            for row in rows {
                let value = row.get(field).cloned().unwrap_or(Value::Null);
                if !seen.iter().any(|v: &Value| v.equivalent(&value)) {
                    seen.push(value.clone());
                    let mut projected = Row::new();
                    projected.set(field.clone(), value);
                    grouped.push(projected);
                }
            }
            rows = grouped;
        } else if let Some(field) = &statement.projection {
            rows = rows
                .into_iter()
                .map(|row| {
                    let mut projected = Row::new();
                    if let Some(value) = row.get(field) {
                        projected.set(field.clone(), value.clone());
                    }
                    projected
                })
                .collect();
        }

        Ok(vec![Some(rows)])
    }

    fn create(&self, table: &str, content: Row) -> RemoteResult<Row> {
        let id = match content.id() {
            Some(id) => coerce_id(table, id).ok_or(RemoteError::MissingId)?,
            None => RecordId::from_parts(table, Uuid::new_v4().simple().to_string().as_str())
                .ok_or(RemoteError::MissingId)?,
        };
        let (row, _) = self.store(table, &id, content);
        self.emit_live(table, LiveAction::Create, row.clone());
        Ok(row)
    }

    fn insert(&self, table: &str, content: Row) -> RemoteResult<Row> {
        let id = content
            .id()
            .and_then(|v| coerce_id(table, v))
            .ok_or(RemoteError::MissingId)?;
        let (row, _) = self.store(table, &id, content);
        self.emit_live(table, LiveAction::Create, row.clone());
        Ok(row)
    }

    fn update_merge(&self, id: &RecordId, patch: Row) -> RemoteResult<Option<Row>> {
        let updated = {
            let mut tables = self.tables.write();
            let rows = match tables.get_mut(id.table()) {
                Some(rows) => rows,
                None => return Ok(None),
            };
            match rows.get_mut(id.canonical()) {
                Some(row) => {
                    row.merge(patch);
                    row.set("id", id.clone());
                    Some(row.clone())
                }
                None => None,
            }
        };
        if let Some(row) = &updated {
            self.emit_live(id.table(), LiveAction::Update, row.clone());
        }
        Ok(updated)
    }

    fn upsert_merge(&self, id: &RecordId, patch: Row) -> RemoteResult<Row> {
        let (row, existed) = {
            let mut tables = self.tables.write();
            let rows = tables.entry(id.table().to_owned()).or_default();
            let mut row = rows
                .get(id.canonical())
                .cloned()
                .unwrap_or_else(|| Row::new().with("id", id.clone()));
            let existed = rows.contains_key(id.canonical());
            row.merge(patch);
            row.set("id", id.clone());
            rows.insert(id.canonical().to_owned(), row.clone());
            (row, existed)
        };
        let action = if existed {
            LiveAction::Update
        } else {
            LiveAction::Create
        };
        self.emit_live(id.table(), action, row.clone());
        Ok(row)
    }

    fn delete(&self, id: &RecordId) -> RemoteResult<()> {
        let removed = self
            .tables
            .write()
            .get_mut(id.table())
            .and_then(|rows| rows.remove(id.canonical()));
        if let Some(row) = removed {
            self.emit_live(id.table(), LiveAction::Delete, row);
        }
        Ok(())
    }

    fn live(&self, table: &str) -> RemoteResult<Arc<dyn LiveHandle>> {
        if !self.supports_live_queries() {
            return Err(RemoteError::LiveUnsupported);
        }
        let handle = Arc::new(MemoryLive::new());
        self.feeds
            .write()
            .entry(table.to_owned())
            .or_default()
            .push(Arc::clone(&handle));
        Ok(handle)
    }

    fn supports_live_queries(&self) -> bool {
        !self.live_disabled.load(AtomicOrdering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Statement evaluation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Statement {
    table: String,
    projection: Option<String>,
    conditions: Vec<Condition>,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    start: Option<u64>,
    group_by: Option<String>,
}

#[derive(Debug)]
enum Condition {
    /// `field <op> $binding` or `field <op> literal`.
    Compare {
        field: String,
        op: &'static str,
        rhs: Rhs,
    },
    /// Literal `true`/`false`.
    Literal(bool),
}

#[derive(Debug)]
enum Rhs {
    Binding(String),
    Bool(bool),
}

impl Statement {
    fn matches(&self, row: &Row, bindings: &BTreeMap<String, Value>) -> bool {
        self.conditions.iter().all(|cond| match cond {
            Condition::Literal(b) => *b,
            Condition::Compare { field, op, rhs } => {
                let lhs = row.get(field);
                let rhs = match rhs {
                    Rhs::Binding(name) => bindings.get(name).cloned(),
                    Rhs::Bool(b) => Some(Value::Bool(*b)),
                };
                let Some(rhs) = rhs else { return false };
                match *op {
                    "=" => match lhs {
                        Some(lhs) => lhs.equivalent(&rhs),
                        // A missing tombstone reads as `false`.
                        None => rhs == Value::Bool(false),
                    },
                    "!=" => lhs.map(|l| !l.equivalent(&rhs)).unwrap_or(true),
                    _ => {
                        let ord = match lhs.and_then(|l| order_values(l, &rhs)) {
                            Some(ord) => ord,
                            None => return false,
                        };
                        match *op {
                            "<" => ord == Ordering::Less,
                            "<=" => ord != Ordering::Greater,
                            ">" => ord == Ordering::Greater,
                            ">=" => ord != Ordering::Less,
                            _ => false,
                        }
                    }
                }
            }
        })
    }
}

fn order_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => order_values(a, b).unwrap_or(Ordering::Equal),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}

/// Total-ish ordering over comparable value pairs.
fn order_values(a: &Value, b: &Value) -> Option<Ordering> {
    use chrono::DateTime;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::Str(y)) => DateTime::parse_from_rfc3339(y)
            .ok()
            .map(|y| x.cmp(&y.with_timezone(&chrono::Utc))),
        (Value::Str(x), Value::DateTime(y)) => DateTime::parse_from_rfc3339(x)
            .ok()
            .map(|x| x.with_timezone(&chrono::Utc).cmp(y)),
        (Value::Record(x), Value::Record(y)) => Some(x.canonical().cmp(y.canonical())),
        (Value::Record(x), Value::Str(y)) => Some(x.canonical().cmp(y.as_str())),
        (Value::Str(x), Value::Record(y)) => Some(x.as_str().cmp(y.canonical())),
        _ => None,
    }
}

fn parse_statement(sql: &str) -> RemoteResult<Statement> {
    let unsupported =
        |what: &str| RemoteError::query(format!("memory remote cannot evaluate {what}: {sql}"));

    let rest = sql
        .strip_prefix("SELECT ")
        .ok_or_else(|| unsupported("non-SELECT statement"))?;
    let (projection, rest) = rest
        .split_once(" FROM ")
        .ok_or_else(|| unsupported("statement without FROM"))?;
    let projection = match projection.trim() {
        "*" => None,
        field if !field.contains(',') => Some(field.to_owned()),
        _ => return Err(unsupported("multi-field projections")),
    };

    let mut rest = rest.trim();
    let mut statement = Statement {
        table: String::new(),
        projection,
        conditions: Vec::new(),
        order_by: Vec::new(),
        limit: None,
        start: None,
        group_by: None,
    };

    // Trailing clauses, right to left.
    if let Some((head, group)) = rest.rsplit_once(" GROUP BY ") {
        statement.group_by = Some(group.trim().to_owned());
        rest = head.trim();
    }
    if let Some((head, start)) = rest.rsplit_once(" START ") {
        statement.start = start.trim().parse().ok();
        rest = head.trim();
    }
    if let Some((head, limit)) = rest.rsplit_once(" LIMIT ") {
        statement.limit = limit.trim().parse().ok();
        rest = head.trim();
    }
    if let Some((head, order)) = rest.rsplit_once(" ORDER BY ") {
        for clause in order.split(',') {
            let clause = clause.trim();
            let (field, descending) = match clause.strip_suffix(" DESC") {
                Some(field) => (field, true),
                None => (clause.strip_suffix(" ASC").unwrap_or(clause), false),
            };
            statement.order_by.push((field.trim().to_owned(), descending));
        }
        rest = head.trim();
    }

    let (table, where_clause) = match rest.split_once(" WHERE ") {
        Some((table, conds)) => (table, Some(conds)),
        None => (rest, None),
    };
    statement.table = table.trim().to_owned();

    if let Some(clause) = where_clause {
        let mut clause = clause.trim();
        if clause.starts_with('(') && clause.ends_with(')') && balanced(clause) {
            clause = &clause[1..clause.len() - 1];
        }
        if clause.contains(" OR ") || clause.contains("!(") || clause.contains("LIKE") {
            return Err(unsupported("this filter shape"));
        }
        for atom in clause.split(" AND ") {
            statement.conditions.push(parse_condition(atom.trim(), sql)?);
        }
    }

    Ok(statement)
}

/// True when stripping the outer parens leaves the string balanced.
fn balanced(clause: &str) -> bool {
    let inner = &clause[1..clause.len() - 1];
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn parse_condition(atom: &str, sql: &str) -> RemoteResult<Condition> {
    match atom {
        "true" => return Ok(Condition::Literal(true)),
        "false" => return Ok(Condition::Literal(false)),
        _ => {}
    }
    for op in ["!=", "<=", ">=", "=", "<", ">"] {
        if let Some((field, rhs)) = atom.split_once(&format!(" {op} ")) {
            let rhs = rhs.trim();
            let rhs = if let Some(name) = rhs.strip_prefix('$') {
                Rhs::Binding(name.to_owned())
            } else {
                match rhs {
                    "true" => Rhs::Bool(true),
                    "false" => Rhs::Bool(false),
                    _ => {
                        return Err(RemoteError::query(format!(
                            "memory remote cannot evaluate literal {rhs:?}: {sql}"
                        )))
                    }
                }
            };
            return Ok(Condition::Compare {
                field: field.trim().to_owned(),
                op,
                rhs,
            });
        }
    }
    Err(RemoteError::query(format!(
        "memory remote cannot evaluate condition {atom:?}: {sql}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_latest_snapshot, build_log_replay, build_select, BuildOptions};
    use crate::expr::{CompareOp, Expr, OrderBy, Subset};
    use chrono::{TimeZone, Utc};

    fn remote_with_tasks() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.seed("task", Row::new().with("id", "task:1").with("rank", 3i64));
        remote.seed("task", Row::new().with("id", "task:2").with("rank", 1i64));
        remote.seed("task", Row::new().with("id", "task:3").with("rank", 2i64));
        remote
    }

    #[test]
    fn select_returns_all_rows() {
        let remote = remote_with_tasks();
        assert_eq!(remote.select("task").unwrap().len(), 3);
        assert!(remote.select("empty").unwrap().is_empty());
    }

    #[test]
    fn create_generates_ids() {
        let remote = MemoryRemote::new();
        let row = remote
            .create("note", Row::new().with("title", "x"))
            .unwrap();
        let id = row.id().unwrap().as_record().unwrap();
        assert_eq!(id.table(), "note");
        assert_eq!(remote.row_count("note"), 1);
    }

    #[test]
    fn create_coerces_bare_keys() {
        let remote = MemoryRemote::new();
        let row = remote
            .create("note", Row::new().with("id", "seed-1"))
            .unwrap();
        assert_eq!(
            row.id().unwrap().as_record().unwrap().canonical(),
            "note:seed-1"
        );
    }

    #[test]
    fn merge_and_delete_emit_live() {
        let remote = remote_with_tasks();
        let handle = remote.live("task").unwrap();
        let seen: Arc<Mutex<Vec<LiveNotification>>> = Arc::default();
        let sink = Arc::clone(&seen);
        handle.subscribe(Arc::new(move |n| sink.lock().push(n)));

        let id = RecordId::parse("task:1").unwrap();
        remote
            .update_merge(&id, Row::new().with("rank", 9i64))
            .unwrap();
        remote.delete(&id).unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, LiveAction::Update);
        assert_eq!(events[0].value.get("rank"), Some(&Value::Int(9)));
        assert_eq!(events[1].action, LiveAction::Delete);
    }

    #[test]
    fn update_missing_row_is_none() {
        let remote = MemoryRemote::new();
        let id = RecordId::parse("task:404").unwrap();
        assert!(remote
            .update_merge(&id, Row::new().with("x", 1i64))
            .unwrap()
            .is_none());
    }

    #[test]
    fn upsert_creates_then_updates() {
        let remote = MemoryRemote::new();
        let id = RecordId::parse("task:9").unwrap();
        let row = remote
            .upsert_merge(&id, Row::new().with("title", "a"))
            .unwrap();
        assert_eq!(row.get("title"), Some(&Value::Str("a".into())));
        let row = remote
            .upsert_merge(&id, Row::new().with("title", "b"))
            .unwrap();
        assert_eq!(row.get("title"), Some(&Value::Str("b".into())));
        assert_eq!(remote.row_count("task"), 1);
    }

    #[test]
    fn kill_is_idempotent_and_stops_delivery() {
        let remote = remote_with_tasks();
        let handle = remote.live("task").unwrap();
        let seen: Arc<Mutex<Vec<LiveNotification>>> = Arc::default();
        let sink = Arc::clone(&seen);
        handle.subscribe(Arc::new(move |n| sink.lock().push(n)));

        handle.kill();
        handle.kill();
        remote
            .create("task", Row::new().with("id", "task:9"))
            .unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, LiveAction::Killed);
    }

    #[test]
    fn live_unsupported_errors() {
        let remote = MemoryRemote::new();
        remote.set_live_supported(false);
        assert!(!remote.supports_live_queries());
        assert!(matches!(
            remote.live("task"),
            Err(RemoteError::LiveUnsupported)
        ));
    }

    #[test]
    fn evaluates_builder_output() {
        let remote = remote_with_tasks();
        let subset = Subset::all()
            .with_filter(Expr::cmp("rank", CompareOp::Ge, 2i64))
            .with_order(OrderBy::asc("rank"));
        let q = build_select("task", &subset, BuildOptions::default()).unwrap();
        let rows = remote.query(&q.sql, &q.bindings).unwrap();
        let rows = rows[0].as_ref().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("rank"), Some(&Value::Int(2)));
        assert_eq!(rows[1].get("rank"), Some(&Value::Int(3)));
    }

    #[test]
    fn evaluates_log_replay_ordering() {
        let remote = MemoryRemote::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (key, offset) in [("a", 2), ("b", 0), ("c", 1)] {
            remote.seed(
                "crdt_update",
                Row::new()
                    .with("id", format!("crdt_update:{key}"))
                    .with("doc", "doc:abc")
                    .with("ts", t0 + chrono::Duration::seconds(offset)),
            );
        }
        remote.seed(
            "crdt_update",
            Row::new()
                .with("id", "crdt_update:other")
                .with("doc", "doc:zzz")
                .with("ts", t0),
        );

        let q = build_log_replay("crdt_update", Value::Str("doc:abc".into()), None);
        let rows = remote.query(&q.sql, &q.bindings).unwrap();
        let rows = rows[0].as_ref().unwrap();
        assert_eq!(rows.len(), 3);
        let keys: Vec<&str> = rows
            .iter()
            .map(|r| r.id().unwrap().as_record().unwrap().key())
            .collect();
        assert_eq!(keys, ["b", "c", "a"]);

        let q = build_log_replay(
            "crdt_update",
            Value::Str("doc:abc".into()),
            Some(Value::DateTime(t0)),
        );
        let rows = remote.query(&q.sql, &q.bindings).unwrap();
        assert_eq!(rows[0].as_ref().unwrap().len(), 2);
    }

    #[test]
    fn evaluates_latest_snapshot() {
        let remote = MemoryRemote::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (key, offset) in [("old", 0), ("new", 5)] {
            remote.seed(
                "crdt_snapshot",
                Row::new()
                    .with("id", format!("crdt_snapshot:{key}"))
                    .with("doc", "doc:abc")
                    .with("ts", t0 + chrono::Duration::seconds(offset)),
            );
        }
        let q = build_latest_snapshot("crdt_snapshot", Value::Str("doc:abc".into()));
        let rows = remote.query(&q.sql, &q.bindings).unwrap();
        let rows = rows[0].as_ref().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id().unwrap().as_record().unwrap().key(), "new");
    }

    #[test]
    fn rejects_unknown_statement_shapes() {
        let remote = MemoryRemote::new();
        assert!(remote.query("DELETE task", &BTreeMap::new()).is_err());
        assert!(remote
            .query("SELECT * FROM t WHERE a = $x OR b = $y", &BTreeMap::new())
            .is_err());
    }

    #[test]
    fn group_by_deduplicates() {
        let remote = MemoryRemote::new();
        for key in ["a", "b", "c"] {
            remote.seed(
                "crdt_update",
                Row::new()
                    .with("id", format!("crdt_update:{key}"))
                    .with("doc", if key == "c" { "doc:2" } else { "doc:1" }),
            );
        }
        let rows = remote
            .query("SELECT doc FROM crdt_update GROUP BY doc", &BTreeMap::new())
            .unwrap();
        assert_eq!(rows[0].as_ref().unwrap().len(), 2);
    }
}
