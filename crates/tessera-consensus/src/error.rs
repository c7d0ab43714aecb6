//! Error types for consensus membership.

use tessera_pki::PkiError;
use tessera_state::StateError;
use thiserror::Error;

/// Result type alias for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("could not {context}: {source}")]
    Pki {
        context: &'static str,
        #[source]
        source: PkiError,
    },

    #[error("a member already advertises peer URL {0}")]
    PeerUrlExists(String),

    /// The peer URL this node would use belongs to a different member.
    #[error("peer URL {url} is already held by member {holder:?}")]
    RaceLost { url: String, holder: String },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("member {0:016x} not found")]
    MemberNotFound(u64),

    #[error("member {0:016x} kept changing underneath the update")]
    Conflict(u64),

    #[error("consensus service is gone")]
    ServiceGone,

    #[error("consensus service is not running")]
    NotRunning,

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("failed to encode record: {0}")]
    Encode(String),
}

impl ConsensusError {
    pub(crate) fn pki(context: &'static str) -> impl FnOnce(PkiError) -> Self {
        move |source| ConsensusError::Pki { context, source }
    }

    /// Whether this error means stored data is unreadable.
    pub fn is_corruption(&self) -> bool {
        match self {
            ConsensusError::Corrupt { .. } => true,
            ConsensusError::Pki { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}
