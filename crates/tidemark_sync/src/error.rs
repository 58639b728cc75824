//! Error types for the sync engine.

use std::sync::Arc;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Consumes engine-side errors that must not tear down the sync.
pub type ErrorSink = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Errors that can occur while syncing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An insert input failed schema validation.
    #[error("schema rejected input: {message}")]
    SchemaRejected {
        /// Description of the rejected input.
        message: String,
    },

    /// A mutation arrived without a usable record key.
    #[error("mutation has no record key")]
    MissingKey,

    /// A mutation arrived before the sync was started.
    #[error("sync has not been started for this collection")]
    NotStarted,

    /// The engine was torn down.
    #[error("sync engine is torn down")]
    TornDown,

    /// Remote-layer failure.
    #[error(transparent)]
    Remote(#[from] tidemark_remote::RemoteError),

    /// Replication-layer failure.
    #[error(transparent)]
    Crdt(#[from] tidemark_crdt::CrdtError),

    /// Core-layer failure (identifiers, envelopes).
    #[error(transparent)]
    Core(#[from] tidemark_core::CoreError),
}

impl SyncError {
    /// Creates a [`SyncError::SchemaRejected`].
    pub fn schema_rejected(message: impl Into<String>) -> Self {
        Self::SchemaRejected {
            message: message.into(),
        }
    }
}
