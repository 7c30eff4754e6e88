//! Error types for the consensus backend.

use crate::types::NodeId;

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, Error>;

/// Errors surfaced by the consensus backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raft protocol error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Consensus storage error.
    #[error("consensus storage error: {0}")]
    Storage(String),

    /// Invalid raft configuration.
    #[error("invalid raft configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation timed out.
    #[error("consensus timeout after {seconds} seconds")]
    Timeout {
        /// Timeout duration in seconds.
        seconds: u64,
    },

    /// Not currently the leader node.
    #[error("not leader: current leader is {leader:?}")]
    NotLeader {
        /// The current leader, if known.
        leader: Option<NodeId>,
    },
}
