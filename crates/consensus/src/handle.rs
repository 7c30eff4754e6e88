//! Thin wrapper around the raft instance exposing the operations the
//! coordinator needs: bootstrap, apply, voter changes and leadership
//! queries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use tracing::{debug, info, warn};

use crate::error::{ConsensusResult, Error};
use crate::log_store::LogStore;
use crate::network::RaftTransport;
use crate::state_machine::KvStateMachine;
use crate::types::{Command, CommandResponse, Node, NodeId, Raft};

/// Handle to the consensus engine.
#[derive(Clone)]
pub struct ConsensusHandle {
    node_id: NodeId,
    raft: Raft,
}

impl ConsensusHandle {
    /// Create the raft instance over the given storage and transport.
    pub async fn new(
        node_id: NodeId,
        config: openraft::Config,
        transport: RaftTransport,
        log_store: LogStore,
        state_machine: KvStateMachine,
    ) -> ConsensusResult<Self> {
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| Error::InvalidConfiguration(e.to_string()))?,
        );

        let raft = Raft::new(node_id.clone(), config, transport, log_store, state_machine)
            .await
            .map_err(|e| Error::Raft(format!("failed to create raft instance: {e}")))?;

        Ok(Self { node_id, raft })
    }

    /// The local consensus identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The underlying raft handle.
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// Initialise a brand-new cluster with the given voter set.
    ///
    /// Re-bootstrapping an already-initialised log is benign.
    pub async fn bootstrap(&self, members: BTreeMap<NodeId, Node>) -> ConsensusResult<()> {
        info!(node = %self.node_id, "bootstrapping cluster with {} voter(s)", members.len());
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!("cluster is already bootstrapped");
                Ok(())
            }
            Err(e) => Err(Error::Raft(format!("bootstrap failed: {e}"))),
        }
    }

    /// Whether this node currently leads the cluster.
    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.node_id.clone())
    }

    /// The current leader, if any is known.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    /// Append a command to the replicated log and wait for the local apply,
    /// bounded by `timeout`.
    pub async fn apply(
        &self,
        command: Command,
        timeout: Duration,
    ) -> ConsensusResult<CommandResponse> {
        match tokio::time::timeout(timeout, self.raft.client_write(command)).await {
            Err(_) => Err(Error::Timeout {
                seconds: timeout.as_secs(),
            }),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward)))) => {
                Err(Error::NotLeader {
                    leader: forward.leader_id,
                })
            }
            Ok(Err(e)) => Err(Error::Raft(format!("apply failed: {e}"))),
        }
    }

    /// Add a node as a voter: first as a learner until it caught up, then
    /// promoted into the voter set. Leader only.
    pub async fn add_voter(&self, id: NodeId, node: Node) -> ConsensusResult<()> {
        let mut voters = self.voter_ids();
        if voters.contains(&id) {
            debug!(node = %id, "already a voter");
            return Ok(());
        }

        info!(node = %id, "adding voter");
        self.raft
            .add_learner(id.clone(), node, true)
            .await
            .map_err(|e| Error::Raft(format!("failed to add learner {id}: {e}")))?;

        voters.insert(id.clone());
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| Error::Raft(format!("failed to promote {id}: {e}")))?;
        Ok(())
    }

    /// Remove a node from the voter set. Leader only.
    pub async fn remove_server(&self, id: &NodeId) -> ConsensusResult<()> {
        let mut voters = self.voter_ids();
        if !voters.remove(id) {
            debug!(node = %id, "not a voter, nothing to remove");
            return Ok(());
        }
        if voters.is_empty() {
            warn!(node = %id, "refusing to remove the last voter");
            return Ok(());
        }

        info!(node = %id, "removing voter");
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| Error::Raft(format!("failed to remove {id}: {e}")))?;
        Ok(())
    }

    /// The current voter configuration.
    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// Shut the raft instance down.
    pub async fn shutdown(&self) -> ConsensusResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Raft(format!("raft shutdown failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for ConsensusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusHandle")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
