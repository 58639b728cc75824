//! Record identifiers.
//!
//! A record identifier is a `(table, key)` pair with the canonical textual
//! form `"<table>:<key>"`. Remote databases and host applications hand the
//! same identifier around in many shapes (quoted strings, bracketed keys,
//! `{table, id}` objects, wrappers around any of those); this module
//! canonicalizes every accepted shape and interns the result so that equal
//! identifiers are pointer-identical, which is what the host runtime's
//! reactive comparators key on.

mod id;
mod intern;
mod normalize;

pub use id::RecordId;
pub use intern::IdentityCache;
pub use normalize::{normalize_deep, RecordIdInput};
