//! Error types for cluster operations.

use crate::types::NodeId;
use openraft::BasicNode;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for engine-level Raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;

/// Type alias for engine-level RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, BasicNode, RaftError<E>>;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Storage engine failure, including reads past the highest offset.
    #[error(transparent)]
    Log(#[from] loghouse_core::LogError),

    /// A write was attempted on a node that is not the leader.
    #[error("not the leader, leader is node {leader:?}")]
    NotLeader {
        /// The current leader if known.
        leader: Option<NodeId>,
    },

    /// A proposal did not commit within the configured timeout.
    #[error("proposal timed out")]
    ProposalTimeout,

    /// The cluster did not elect a leader within the wait window.
    #[error("timed out waiting for a leader")]
    NoLeader,

    /// The authorizer rejected the request.
    #[error("permission denied: {subject:?} may not {action}")]
    PermissionDenied {
        /// The authenticated subject, empty when the peer presented no cert.
        subject: String,
        /// The rejected action.
        action: String,
    },

    /// The state machine rejected or failed to apply a committed command.
    #[error("apply failed: {0}")]
    Apply(String),

    /// Consensus engine error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Network/RPC error.
    #[error("network error: {0}")]
    Network(#[from] tonic::Status),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A replicated command frame that could not be decoded.
    #[error("invalid command frame")]
    InvalidCommand,

    /// Stable store failure.
    #[error("stable store: {0}")]
    StableStore(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for ClusterError {
    fn from(e: prost::DecodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
