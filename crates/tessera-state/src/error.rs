//! Error types for the Tessera state layer.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while building keys or talking to a store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The store could not be reached (network partition, closed client).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Whether this error came from building a key rather than the store.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, StateError::InvalidKey(_))
    }
}
