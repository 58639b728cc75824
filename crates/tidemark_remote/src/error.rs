//! Error types for the remote layer.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur talking to the remote database.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// A subset descriptor could not be translated into a query.
    ///
    /// Raised before any query is issued; always a caller bug.
    #[error("query translation failed: {message}")]
    Translation {
        /// Description of the untranslatable construct.
        message: String,
    },

    /// The remote rejected or failed a query.
    #[error("query failed: {message}")]
    Query {
        /// Description of the failure.
        message: String,
    },

    /// Network or driver failure.
    #[error("remote unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The remote does not support live queries.
    #[error("live queries are not supported by this remote")]
    LiveUnsupported,

    /// A row arrived without a usable record id.
    #[error("row has no record id")]
    MissingId,

    /// Core-layer failure (identifiers, envelopes).
    #[error(transparent)]
    Core(#[from] tidemark_core::CoreError),
}

impl RemoteError {
    /// Creates a [`RemoteError::Translation`].
    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    /// Creates a [`RemoteError::Query`].
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Creates a [`RemoteError::Unavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// True when the failure happened before any query was issued.
    #[must_use]
    pub fn is_translation(&self) -> bool {
        matches!(self, Self::Translation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_errors_are_flagged() {
        assert!(RemoteError::translation("bad operator").is_translation());
        assert!(!RemoteError::query("boom").is_translation());
    }
}
