//! # Tidemark Remote
//!
//! The remote database side of the Tidemark sync adapter.
//!
//! This crate provides:
//! - The [`RemoteDatabase`] capability the sync engine consumes
//! - The where-expression tree and its translation to the remote's
//!   query language
//! - [`TableClient`], the query-shaped surface over one table
//! - [`MemoryRemote`], an in-memory remote with live channels

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod client;
pub mod error;
pub mod expr;
pub mod table;

pub use client::{LiveAction, LiveHandle, LiveNotification, MemoryRemote, RemoteDatabase};
pub use error::{RemoteError, RemoteResult};
pub use expr::{CompareOp, Expr, Operand, OrderBy, Subset};
pub use table::{LiveSubscription, TableClient, TableEvent, TableEventKind, TableTarget};
