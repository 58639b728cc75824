//! The CRDT engine contract and a last-writer-wins reference engine.
//!
//! The adapter only ever touches a document through the capability traits
//! here, so any engine that can expose a named map container, a named text
//! container, and incremental export/import can back the replication layer.
//! [`LwwEngine`] is the engine used by default and in tests: registers with
//! `(lamport, actor)` tie-breaking over an actor-sequenced op log.

use crate::error::{CrdtError, CrdtResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidemark_core::Value;

/// One replicated document.
///
/// Documents are mutable through container handles addressed by name; the
/// adapter's profiles decide which containers exist and what they mean.
pub trait CrdtDoc: Send {
    /// Changes the actor identity used for subsequent local writes.
    fn set_actor(&mut self, actor: &str);

    /// An opaque encoding of the document's current version.
    fn version(&self) -> Vec<u8>;

    /// Exports changes made since `from` (a captured [`version`](Self::version)),
    /// or the full history when `from` is `None`.
    fn export_update(&self, from: Option<&[u8]>) -> CrdtResult<Vec<u8>>;

    /// Exports a self-contained snapshot.
    fn export_snapshot(&self) -> CrdtResult<Vec<u8>>;

    /// Merges an exported update or snapshot into this document.
    fn import(&mut self, bytes: &[u8]) -> CrdtResult<()>;

    /// Writes one key of a named map container.
    fn map_set(&mut self, container: &str, key: &str, value: Value);

    /// Reads a named map container as plain values.
    fn map_entries(&self, container: &str) -> BTreeMap<String, Value>;

    /// Replaces the content of a named text container.
    fn text_update(&mut self, container: &str, text: &str);

    /// Reads a named text container.
    fn text_to_string(&self, container: &str) -> String;
}

/// Creates documents.
pub trait CrdtEngine: Send + Sync {
    /// Creates an empty document writing as `actor`.
    fn create_doc(&self, actor: &str) -> Box<dyn CrdtDoc>;
}

// ---------------------------------------------------------------------------
// Reference engine
// ---------------------------------------------------------------------------

/// The default engine: last-writer-wins registers over an op log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LwwEngine;

impl CrdtEngine for LwwEngine {
    fn create_doc(&self, actor: &str) -> Box<dyn CrdtDoc> {
        Box::new(LwwDoc::new(actor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum OpTarget {
    Map {
        container: String,
        key: String,
        value: Value,
    },
    Text {
        container: String,
        text: String,
    },
}

/// One register write. `(actor, seq)` identifies the op; `lamport` orders
/// concurrent writes, ties broken by actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LwwOp {
    actor: String,
    seq: u64,
    lamport: u64,
    target: OpTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UpdatePayload {
    ops: Vec<LwwOp>,
}

#[derive(Debug, Clone, PartialEq)]
struct Register<T> {
    lamport: u64,
    actor: String,
    value: T,
}

impl<T> Register<T> {
    fn loses_to(&self, lamport: u64, actor: &str) -> bool {
        (lamport, actor) > (self.lamport, self.actor.as_str())
    }
}

/// An [`LwwEngine`] document.
#[derive(Debug)]
pub struct LwwDoc {
    actor: String,
    clock: u64,
    ops: Vec<LwwOp>,
    /// Highest seq observed per actor.
    version: BTreeMap<String, u64>,
    maps: HashMap<(String, String), Register<Value>>,
    texts: HashMap<String, Register<String>>,
}

impl LwwDoc {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_owned(),
            clock: 0,
            ops: Vec::new(),
            version: BTreeMap::new(),
            maps: HashMap::new(),
            texts: HashMap::new(),
        }
    }

    fn record_local(&mut self, target: OpTarget) {
        self.clock += 1;
        let seq = self.version.get(&self.actor).copied().unwrap_or(0) + 1;
        let op = LwwOp {
            actor: self.actor.clone(),
            seq,
            lamport: self.clock,
            target,
        };
        self.apply(&op);
        self.version.insert(self.actor.clone(), seq);
        self.ops.push(op);
    }

    fn apply(&mut self, op: &LwwOp) {
        match &op.target {
            OpTarget::Map {
                container,
                key,
                value,
            } => {
                let slot = (container.clone(), key.clone());
                let wins = self
                    .maps
                    .get(&slot)
                    .map(|reg| reg.loses_to(op.lamport, &op.actor))
                    .unwrap_or(true);
                if wins {
                    self.maps.insert(
                        slot,
                        Register {
                            lamport: op.lamport,
                            actor: op.actor.clone(),
                            value: value.clone(),
                        },
                    );
                }
            }
            OpTarget::Text { container, text } => {
                let wins = self
                    .texts
                    .get(container)
                    .map(|reg| reg.loses_to(op.lamport, &op.actor))
                    .unwrap_or(true);
                if wins {
                    self.texts.insert(
                        container.clone(),
                        Register {
                            lamport: op.lamport,
                            actor: op.actor.clone(),
                            value: text.clone(),
                        },
                    );
                }
            }
        }
    }

    fn decode_version(bytes: &[u8]) -> CrdtResult<BTreeMap<String, u64>> {
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(bytes)
            .map_err(|e| CrdtError::malformed(format!("version vector: {e}")))
    }
}

impl CrdtDoc for LwwDoc {
    fn set_actor(&mut self, actor: &str) {
        if self.actor != actor {
            self.actor = actor.to_owned();
        }
    }

    fn version(&self) -> Vec<u8> {
        serde_json::to_vec(&self.version).unwrap_or_default()
    }

    fn export_update(&self, from: Option<&[u8]>) -> CrdtResult<Vec<u8>> {
        let seen = match from {
            Some(bytes) => Self::decode_version(bytes)?,
            None => BTreeMap::new(),
        };
        let ops: Vec<LwwOp> = self
            .ops
            .iter()
            .filter(|op| op.seq > seen.get(&op.actor).copied().unwrap_or(0))
            .cloned()
            .collect();
        Ok(serde_json::to_vec(&UpdatePayload { ops })?)
    }

    fn export_snapshot(&self) -> CrdtResult<Vec<u8>> {
        Ok(serde_json::to_vec(&UpdatePayload {
            ops: self.ops.clone(),
        })?)
    }

    fn import(&mut self, bytes: &[u8]) -> CrdtResult<()> {
        let payload: UpdatePayload = serde_json::from_slice(bytes)
            .map_err(|e| CrdtError::malformed(format!("update payload: {e}")))?;
        for op in payload.ops {
            let seen = self.version.get(&op.actor).copied().unwrap_or(0);
            if op.seq <= seen {
                continue;
            }
            self.apply(&op);
            self.clock = self.clock.max(op.lamport);
            self.version.insert(op.actor.clone(), op.seq.max(seen));
            self.ops.push(op);
        }
        Ok(())
    }

    fn map_set(&mut self, container: &str, key: &str, value: Value) {
        self.record_local(OpTarget::Map {
            container: container.to_owned(),
            key: key.to_owned(),
            value,
        });
    }

    fn map_entries(&self, container: &str) -> BTreeMap<String, Value> {
        self.maps
            .iter()
            .filter(|((c, _), _)| c == container)
            .map(|((_, key), reg)| (key.clone(), reg.value.clone()))
            .collect()
    }

    fn text_update(&mut self, container: &str, text: &str) {
        self.record_local(OpTarget::Text {
            container: container.to_owned(),
            text: text.to_owned(),
        });
    }

    fn text_to_string(&self, container: &str) -> String {
        self.texts
            .get(container)
            .map(|reg| reg.value.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(actor: &str) -> Box<dyn CrdtDoc> {
        LwwEngine.create_doc(actor)
    }

    #[test]
    fn map_set_and_read() {
        let mut d = doc("a");
        d.map_set("root", "title", Value::Str("hello".into()));
        d.map_set("root", "done", Value::Bool(false));
        let entries = d.map_entries("root");
        assert_eq!(entries.get("title"), Some(&Value::Str("hello".into())));
        assert_eq!(entries.len(), 2);
        assert!(d.map_entries("other").is_empty());
    }

    #[test]
    fn text_replaces() {
        let mut d = doc("a");
        assert_eq!(d.text_to_string("content"), "");
        d.text_update("content", "first");
        d.text_update("content", "second");
        assert_eq!(d.text_to_string("content"), "second");
    }

    #[test]
    fn incremental_export_skips_seen_ops() {
        let mut a = doc("a");
        a.map_set("root", "x", Value::Int(1));
        let before = a.version();
        a.map_set("root", "y", Value::Int(2));

        let mut b = doc("b");
        b.import(&a.export_update(None).unwrap()).unwrap();
        assert_eq!(b.map_entries("root").len(), 2);

        let delta = a.export_update(Some(&before)).unwrap();
        let payload: UpdatePayload = serde_json::from_slice(&delta).unwrap();
        assert_eq!(payload.ops.len(), 1);
    }

    #[test]
    fn import_is_idempotent() {
        let mut a = doc("a");
        a.map_set("root", "x", Value::Int(1));
        let update = a.export_update(None).unwrap();

        let mut b = doc("b");
        b.import(&update).unwrap();
        b.import(&update).unwrap();
        assert_eq!(b.map_entries("root").get("x"), Some(&Value::Int(1)));
        assert_eq!(b.version(), {
            let mut once = doc("c");
            once.import(&update).unwrap();
            once.version()
        });
    }

    #[test]
    fn concurrent_writes_converge() {
        let mut a = doc("a");
        let mut b = doc("b");
        a.map_set("root", "title", Value::Str("from a".into()));
        b.map_set("root", "title", Value::Str("from b".into()));

        let ua = a.export_update(None).unwrap();
        let ub = b.export_update(None).unwrap();
        a.import(&ub).unwrap();
        b.import(&ua).unwrap();

        // Same lamport on both writes: the higher actor wins on both sides.
        assert_eq!(a.map_entries("root"), b.map_entries("root"));
        assert_eq!(
            a.map_entries("root").get("title"),
            Some(&Value::Str("from b".into()))
        );
    }

    #[test]
    fn later_lamport_wins() {
        let mut a = doc("a");
        a.map_set("root", "title", Value::Str("old".into()));
        let sync = a.export_update(None).unwrap();

        let mut b = doc("b");
        b.import(&sync).unwrap();
        b.map_set("root", "title", Value::Str("new".into()));

        a.import(&b.export_update(None).unwrap()).unwrap();
        assert_eq!(
            a.map_entries("root").get("title"),
            Some(&Value::Str("new".into()))
        );
    }

    #[test]
    fn snapshot_then_update_replay() {
        let mut source = doc("a");
        source.map_set("root", "x", Value::Int(1));
        let snapshot = source.export_snapshot().unwrap();
        let at_snapshot = source.version();
        source.map_set("root", "x", Value::Int(2));
        let tail = source.export_update(Some(&at_snapshot)).unwrap();

        let mut restored = doc("b");
        restored.import(&snapshot).unwrap();
        assert_eq!(restored.map_entries("root").get("x"), Some(&Value::Int(1)));
        restored.import(&tail).unwrap();
        assert_eq!(restored.map_entries("root").get("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn set_actor_switches_attribution() {
        let mut d = doc("a");
        d.map_set("root", "x", Value::Int(1));
        d.set_actor("b");
        d.map_set("root", "x", Value::Int(2));
        let payload: UpdatePayload =
            serde_json::from_slice(&d.export_update(None).unwrap()).unwrap();
        assert_eq!(payload.ops[0].actor, "a");
        assert_eq!(payload.ops[1].actor, "b");
    }

    #[test]
    fn malformed_import_fails() {
        let mut d = doc("a");
        assert!(d.import(b"not json").is_err());
    }
}
