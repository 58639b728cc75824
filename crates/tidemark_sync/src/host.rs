//! The host-runtime session contract.
//!
//! The reactive collection runtime hands the adapter a session when it
//! starts a sync; every change the adapter surfaces flows through it as a
//! `begin`/`write`.../`commit` batch. The write surface is an explicit
//! capability, not a string-keyed utility bag.

use parking_lot::Mutex;
use tidemark_core::{RecordId, Row};

/// One write against the host's materialized view.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace the row under its key.
    Upsert(Row),
    /// Evict the row for this id.
    Delete(RecordId),
}

/// The control surface a host runtime supplies to one sync.
///
/// Calls are infallible from the adapter's point of view; a host that
/// fails internally must not propagate into the engine. Within one sync,
/// the adapter guarantees `begin`/`commit` pairing and serialized batches.
pub trait SyncSession: Send + Sync {
    /// Opens an emission batch.
    fn begin(&self);

    /// Applies one write inside the current batch.
    fn write(&self, op: WriteOp);

    /// Closes the current batch.
    fn commit(&self);

    /// Signals that the collection is usable (called exactly once).
    fn mark_ready(&self);

    /// Drops every row the host holds for this collection.
    fn truncate(&self);
}

/// Everything a [`RecordingSession`] observed, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    /// `begin()` ran.
    Begin,
    /// `write(op)` ran.
    Write(WriteOp),
    /// `commit()` ran.
    Commit,
    /// `mark_ready()` ran.
    MarkReady,
    /// `truncate()` ran.
    Truncate,
}

/// A session double that records every call for assertions.
#[derive(Debug, Default)]
pub struct RecordingSession {
    calls: Mutex<Vec<SessionCall>>,
}

impl RecordingSession {
    /// Creates an empty recording session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    /// Only the writes, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteOp> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SessionCall::Write(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Upserted rows, in order.
    #[must_use]
    pub fn upserts(&self) -> Vec<Row> {
        self.writes()
            .into_iter()
            .filter_map(|op| match op {
                WriteOp::Upsert(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    /// Deleted ids, in order.
    #[must_use]
    pub fn deletes(&self) -> Vec<RecordId> {
        self.writes()
            .into_iter()
            .filter_map(|op| match op {
                WriteOp::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// How many times `mark_ready` ran.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SessionCall::MarkReady))
            .count()
    }

    /// How many batches were opened.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SessionCall::Begin))
            .count()
    }

    /// True when every `begin` was closed by exactly one `commit` and no
    /// write happened outside a batch.
    #[must_use]
    pub fn batches_well_formed(&self) -> bool {
        let mut open = false;
        for call in self.calls.lock().iter() {
            match call {
                SessionCall::Begin => {
                    if open {
                        return false;
                    }
                    open = true;
                }
                SessionCall::Commit => {
                    if !open {
                        return false;
                    }
                    open = false;
                }
                SessionCall::Write(_) => {
                    if !open {
                        return false;
                    }
                }
                SessionCall::MarkReady | SessionCall::Truncate => {}
            }
        }
        !open
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl SyncSession for RecordingSession {
    fn begin(&self) {
        self.calls.lock().push(SessionCall::Begin);
    }

    fn write(&self, op: WriteOp) {
        self.calls.lock().push(SessionCall::Write(op));
    }

    fn commit(&self) {
        self.calls.lock().push(SessionCall::Commit);
    }

    fn mark_ready(&self) {
        self.calls.lock().push(SessionCall::MarkReady);
    }

    fn truncate(&self) {
        self.calls.lock().push(SessionCall::Truncate);
    }
}
