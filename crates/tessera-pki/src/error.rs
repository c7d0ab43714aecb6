//! Error types for certificate issuance.

use tessera_state::StateError;
use thiserror::Error;

/// Result type alias for PKI operations.
pub type PkiResult<T> = Result<T, PkiError>;

/// Errors that can occur while issuing, storing, or parsing certificates.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error("could not encode record: {0}")]
    Encode(String),

    /// A stored record or its DER payload could not be decoded.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("could not parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("{0} is not a self-signed certificate authority")]
    NotAnAuthority(String),

    #[error("certificate {0} not found")]
    NotFound(String),

    #[error("CRL for {0} kept changing underneath the update")]
    Conflict(String),
}

impl From<rcgen::Error> for PkiError {
    fn from(e: rcgen::Error) -> Self {
        PkiError::Generate(e.to_string())
    }
}

impl PkiError {
    /// Whether this error means stored data is unreadable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, PkiError::Corrupt { .. })
    }
}
