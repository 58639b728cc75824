//! # Tidemark Core
//!
//! Shared foundation for the Tidemark synchronization adapter.
//!
//! This crate provides:
//! - Record identifier canonicalization and interning
//! - The document value model used across the workspace
//! - The encrypted envelope codec (AES-256-GCM with associated data)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod record;
pub mod value;

pub use error::{CoreError, CoreResult};
pub use record::{normalize_deep, IdentityCache, RecordId, RecordIdInput};
pub use value::{Row, Value};
