//! Type definitions for the consensus engine integration.
//!
//! The engine requires a type configuration naming the concrete application
//! types: proposals are framed command bytes (see [`crate::command`]) and
//! responses carry the offset the state machine assigned.

use crate::command::CommandResponse;
use openraft::BasicNode;
use std::io::Cursor;

/// Node ID type for the cluster. Each node has a unique 64-bit identifier.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Consensus type configuration for loghouse.
    pub TypeConfig:
        D = Vec<u8>,
        R = CommandResponse,
);

/// Type alias for the Raft instance.
pub type LogRaft = openraft::Raft<TypeConfig>;

/// Type alias for a log entry.
pub type RaftEntry = openraft::Entry<TypeConfig>;

/// Type alias for a vote.
pub type RaftVote = openraft::Vote<NodeId>;

/// Type alias for a log ID.
pub type RaftLogId = openraft::LogId<NodeId>;

/// Type alias for a stored membership.
pub type RaftStoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata.
pub type RaftSnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

/// Type alias for a snapshot.
pub type RaftSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for a storage error.
pub type RaftStorageError = openraft::StorageError<NodeId>;

/// Type alias for client write errors.
pub type RaftClientWriteError = openraft::error::ClientWriteError<NodeId, BasicNode>;

/// Type alias for a raft error wrapping a client write error.
pub type RaftWriteError = openraft::error::RaftError<NodeId, RaftClientWriteError>;

/// Information about the leader a write should be forwarded to.
#[derive(Debug, Clone)]
pub struct LeaderInfo {
    /// The leader's node ID.
    pub leader_id: NodeId,
    /// The leader's rpc address (may be empty if unknown).
    pub leader_addr: String,
}

/// Extract forward-to-leader info from a client write error.
///
/// Returns `Some(LeaderInfo)` when the error is a ForwardToLeader error with
/// a known leader ID, `None` otherwise.
pub fn extract_forward_to_leader(error: &RaftWriteError) -> Option<LeaderInfo> {
    use openraft::error::RaftError;

    match error {
        RaftError::APIError(RaftClientWriteError::ForwardToLeader(forward)) => {
            forward.leader_id.map(|leader_id| LeaderInfo {
                leader_id,
                leader_addr: forward
                    .leader_node
                    .as_ref()
                    .map(|n| n.addr.clone())
                    .unwrap_or_default(),
            })
        }
        _ => None,
    }
}

/// Whether a client write error is a forward-to-leader rejection at all,
/// even when no leader is currently known.
pub fn is_forward_to_leader(error: &RaftWriteError) -> bool {
    matches!(
        error,
        openraft::error::RaftError::APIError(RaftClientWriteError::ForwardToLeader(_))
    )
}
