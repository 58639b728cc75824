//! Error types for Tidemark core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record identifier could not be formed from the input.
    #[error("invalid record id: {message}")]
    InvalidRecordId {
        /// Description of the rejected input.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed (wrong key, wrong AAD, or corrupted data).
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// The envelope names an algorithm this provider does not implement.
    #[error("unsupported envelope algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The algorithm label found in the envelope.
        algorithm: String,
    },

    /// The envelope names a key this provider does not hold.
    #[error("unknown key id: {key_id}")]
    UnknownKeyId {
        /// The key id found in the envelope.
        key_id: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// A stored envelope row is missing fields or carries malformed text.
    #[error("malformed envelope: {message}")]
    MalformedEnvelope {
        /// Description of the defect.
        message: String,
    },

    /// An encrypted payload decoded to something other than an object.
    #[error("envelope payload is not an object")]
    PayloadNotObject,

    /// JSON encode/decode error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates an [`CoreError::InvalidRecordId`].
    pub fn invalid_record_id(message: impl Into<String>) -> Self {
        Self::InvalidRecordId {
            message: message.into(),
        }
    }

    /// Creates an [`CoreError::EncryptionFailed`].
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an [`CoreError::DecryptionFailed`].
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an [`CoreError::MalformedEnvelope`].
    pub fn malformed_envelope(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
        }
    }

    /// Creates an [`CoreError::InvalidKeySize`].
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }
}
