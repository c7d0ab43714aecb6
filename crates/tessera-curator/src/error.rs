//! Curator errors and their public status vocabulary.
//!
//! Internally every failure keeps its full context. At the RPC boundary
//! errors collapse to a handful of codes with fixed messages; anything that
//! could expose store internals is logged here and replaced.

use std::future::Future;
use std::time::Duration;

use tessera_consensus::ConsensusError;
use tessera_state::StateError;
use thiserror::Error;
use tracing::{error, warn};

use crate::node::NodeState;

/// Result type alias for curator operations.
pub type CuratorResult<T> = Result<T, CuratorError>;

#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored record or an embedded certificate failed to decode.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("leadership lost")]
    LostLeadership,

    #[error("leadership held by {holder}")]
    LeadershipHeld { holder: String },

    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,

    #[error("node {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("node {id} is {state:?}, not UP")]
    NotUp { id: String, state: NodeState },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to encode record: {0}")]
    Encode(String),
}

/// Stable classification of curator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unavailable,
    DataLoss,
    /// Admission was won by a different node.
    Aborted,
    FailedPrecondition,
    DeadlineExceeded,
}

impl CuratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CuratorError::Store(e) if e.is_invalid_key() => ErrorKind::InvalidArgument,
            CuratorError::Store(_) | CuratorError::Encode(_) => ErrorKind::Unavailable,
            CuratorError::Consensus(e) => consensus_kind(e),
            CuratorError::NodeNotFound(_) => ErrorKind::NotFound,
            CuratorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CuratorError::Corrupt { .. } => ErrorKind::DataLoss,
            CuratorError::LostLeadership | CuratorError::LeadershipHeld { .. } => {
                ErrorKind::Unavailable
            }
            CuratorError::AlreadyBootstrapped
            | CuratorError::InvalidTransition { .. }
            | CuratorError::NotUp { .. } => ErrorKind::FailedPrecondition,
            CuratorError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }
}

fn consensus_kind(e: &ConsensusError) -> ErrorKind {
    if e.is_corruption() {
        return ErrorKind::DataLoss;
    }
    match e {
        ConsensusError::InvalidPublicKey(_) | ConsensusError::InvalidArgument(_) => {
            ErrorKind::InvalidArgument
        }
        ConsensusError::Store(s) if s.is_invalid_key() => ErrorKind::InvalidArgument,
        ConsensusError::RaceLost { .. } => ErrorKind::Aborted,
        _ => ErrorKind::Unavailable,
    }
}

impl From<CuratorError> for tonic::Status {
    fn from(e: CuratorError) -> Self {
        match e.kind() {
            ErrorKind::InvalidArgument => tonic::Status::invalid_argument(e.to_string()),
            ErrorKind::NotFound => tonic::Status::not_found("node not found"),
            ErrorKind::FailedPrecondition => tonic::Status::failed_precondition(e.to_string()),
            ErrorKind::Aborted => {
                tonic::Status::aborted("consensus admission won by a different node")
            }
            ErrorKind::DeadlineExceeded => tonic::Status::deadline_exceeded("deadline exceeded"),
            ErrorKind::DataLoss => {
                error!(error = %e, "corrupt cluster state");
                tonic::Status::unavailable("internal error")
            }
            ErrorKind::Unavailable => {
                warn!(error = %e, "request failed");
                tonic::Status::unavailable("internal error")
            }
        }
    }
}

/// Run `fut`, failing with `DeadlineExceeded` if it takes longer than
/// `deadline`. The future is dropped on expiry.
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = CuratorResult<T>>,
) -> CuratorResult<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| CuratorError::DeadlineExceeded)?
}
