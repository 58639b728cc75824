//! # Tidemark Sync
//!
//! The orchestration layer of the Tidemark sync adapter.
//!
//! This crate provides:
//! - The host-runtime session contract ([`SyncSession`], [`WriteOp`])
//! - The sync engine: hydration, diff emission, live-event routing, and
//!   the mutation path, serialized through a per-sync work queue
//! - The subset cache that gates live delivery in on-demand mode
//! - The [`Collection`] facade that composes everything from a
//!   [`CollectionOptions`] record

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod queue;
pub mod subset_cache;

pub use collection::{Collection, Mutation, SyncControl};
pub use config::{CollectionOptions, CrdtOptions, E2eeOptions, SyncMode};
pub use engine::{SyncEngine, SyncEngineState, SyncStats};
pub use error::{ErrorSink, SyncError, SyncResult};
pub use host::{RecordingSession, SessionCall, SyncSession, WriteOp};
