//! # Tidemark CRDT
//!
//! The replication layer of the Tidemark sync adapter.
//!
//! This crate provides:
//! - The [`CrdtDoc`]/[`CrdtEngine`] capability contract the adapter
//!   consumes (named map and text containers, incremental export, import)
//! - [`LwwEngine`], a reference engine backed by an actor-sequenced op log
//!   with a per-actor version vector
//! - The `json` and `richtext` materialization profiles
//! - [`Replicator`]: per-document instances, update-log persistence,
//!   snapshot hydration, and actor-based loop prevention

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod profile;
pub mod replicator;

pub use engine::{CrdtDoc, CrdtEngine, LwwEngine};
pub use error::{CrdtError, CrdtResult};
pub use profile::{LocalChange, Profile};
pub use replicator::{
    ActorResolver, ApplyChangeFn, HydrateOutcome, MaterializeFn, Replicator, ReplicatorConfig,
};
