//! Consensus backend for the replicated store.
//!
//! Supplies everything the raft engine consumes: the type configuration and
//! command format, RocksDB-backed log and stable storage, the state machine
//! that materialises committed commands into the local store, and the TCP
//! transport. The coordinator drives it all through [`ConsensusHandle`].

mod error;
mod handle;
mod log_store;
mod network;
mod state_machine;
mod types;

pub use error::{ConsensusResult, Error};
pub use handle::ConsensusHandle;
pub use log_store::{LogStore, open_raft_db};
pub use network::{RPC_TIMEOUT, RaftClient, RaftListener, RaftTransport};
pub use state_machine::{KvSnapshotBuilder, KvStateMachine};
pub use types::{Command, CommandResponse, Node, NodeId, Op, Raft, TypeConfig, raft_config};
