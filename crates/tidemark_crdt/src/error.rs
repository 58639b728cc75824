//! Error types for the CRDT layer.

use thiserror::Error;

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors that can occur in the replication layer.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// An update or snapshot payload could not be decoded.
    #[error("malformed crdt payload: {message}")]
    MalformedPayload {
        /// Description of the defect.
        message: String,
    },

    /// A log row arrived without a usable document id.
    #[error("log row has no document id")]
    MissingDocId,

    /// Snapshot persistence was requested without a snapshots table.
    #[error("no snapshots table is configured")]
    SnapshotsUnconfigured,

    /// Remote-layer failure.
    #[error(transparent)]
    Remote(#[from] tidemark_remote::RemoteError),

    /// Core-layer failure (envelopes, identifiers).
    #[error(transparent)]
    Core(#[from] tidemark_core::CoreError),

    /// JSON encode/decode error inside engine payloads.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CrdtError {
    /// Creates a [`CrdtError::MalformedPayload`].
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }
}
