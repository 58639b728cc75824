//! Basic Tidemark Example - Synced Task Collection
//!
//! This example demonstrates the adapter's core flow:
//! - Standing up a collection over a remote table
//! - Eager hydration into a host session
//! - Live change delivery
//! - The mutation path (insert, update, soft delete)
//!
//! Run with: cargo run -p task_sync

use std::sync::Arc;
use tidemark_core::{Row, Value};
use tidemark_remote::{MemoryRemote, RemoteDatabase, TableTarget};
use tidemark_sync::{Collection, CollectionOptions, Mutation, SyncSession, WriteOp};

/// A host session that prints every change it receives.
struct PrintSession;

impl SyncSession for PrintSession {
    fn begin(&self) {
        println!("-- batch --");
    }

    fn write(&self, op: WriteOp) {
        match op {
            WriteOp::Upsert(row) => println!("  upsert {}", row.to_json()),
            WriteOp::Delete(id) => println!("  delete {id}"),
        }
    }

    fn commit(&self) {}

    fn mark_ready(&self) {
        println!("== collection ready ==");
    }

    fn truncate(&self) {
        println!("== collection truncated ==");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // An in-memory stand-in for the real document database.
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(
        "task",
        Row::new()
            .with("id", "task:groceries")
            .with("title", "Buy groceries")
            .with("done", false),
    );

    let collection = Collection::new(CollectionOptions::new(
        Arc::clone(&remote),
        TableTarget::new("task"),
    ));
    let control = collection.start_sync(Arc::new(PrintSession));

    // A change made by "another client" arrives over the live stream.
    remote.create(
        "task",
        Row::new()
            .with("id", "task:dishes")
            .with("title", "Do the dishes")
            .with("done", false),
    )?;

    // Local mutations: validated, optimistically applied, persisted.
    let row = collection.validate_insert(Value::Object(
        [
            ("title".to_owned(), Value::Str("Water the plants".into())),
            ("done".to_owned(), Value::Bool(false)),
        ]
        .into_iter()
        .collect(),
    ))?;
    collection.on_insert(vec![Mutation::insert(row)])?;

    collection.on_update(vec![Mutation::update(
        "task:groceries",
        Row::new().with("done", true),
    )])?;
    collection.on_delete(vec![Mutation::delete("task:dishes")])?;

    println!("rows on the remote: {}", remote.row_count("task"));
    control.cleanup();
    Ok(())
}
