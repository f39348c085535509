use thiserror::Error;

use cairn_crypto::CryptoError;

/// Errors from session lifecycle and repository operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backing store was unreachable or returned an error.
    #[error("store error: {0}")]
    Store(String),

    /// An attribute value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Attribute encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation is not allowed in the session's current state
    /// (for example, writing to an invalidated session).
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// A concurrent writer won a race (invalidation or id change).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The owning session manager has been shut down.
    #[error("session manager is closed")]
    Closed,
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
