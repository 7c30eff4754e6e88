//! The coordinator tying membership, consensus and the local store
//! together.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use replikv_consensus::{
    Command, ConsensusHandle, KvStateMachine, LogStore, Node, NodeId, RaftListener, RaftTransport,
    open_raft_db, raft_config,
};
use replikv_membership::{Address, Event, Gossip, GossipConfig};
use replikv_store::LocalStore;

use crate::config::{APPLY_EVENT, EngineConfig, RAFT_DB_FILE, RAFT_TIMEOUT};
use crate::error::{EngineResult, Error};

/// A replicated embedded key/value store node.
///
/// Cloning is cheap; every clone drives the same node. Construct with
/// [`Engine::new`], then call [`Engine::start`] once — it bootstraps or
/// joins the cluster and pumps membership events until the node is closed
/// or hits a fatal error.
#[derive(Clone)]
pub struct Engine {
    real_addr: Address,
    store: LocalStore,
    gate: Arc<RwLock<()>>,
    gossip: Arc<Gossip>,
    consensus: ConsensusHandle,
    raft_listener: Arc<RaftListener>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    /// Open the local store, wipe the per-node consensus state and wire up
    /// the membership and consensus layers.
    ///
    /// The consensus state directory is named by the hash of the real
    /// consensus endpoint, so only one process per advertised endpoint may
    /// run on a host; a second one fails to bind here.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let bind = config.bind.clone();
        let advertise = config.advertise.clone();
        let real_addr = config.real_addr().clone();

        let store = LocalStore::open(config.store)?;

        info!(
            "starting replikv node:\n  - gossip listening on {} ({})\n  - raft listening on {} ({})",
            bind,
            real_addr,
            bind.consensus_endpoint(),
            real_addr.consensus_endpoint(),
        );

        let mut gossip_config = GossipConfig::new(bind.clone());
        gossip_config.advertise = advertise;
        let gossip = Gossip::new(gossip_config).await?;

        let raft_endpoint = real_addr.consensus_endpoint();
        let state_dir = prepare_state_dir(&config.state_dir, &raft_endpoint.hash())?;
        let raft_db = open_raft_db(state_dir.join(RAFT_DB_FILE))?;

        let gate = Arc::new(RwLock::new(()));
        let log_store = LogStore::new(raft_db.clone());
        let state_machine = KvStateMachine::new(raft_db, store.clone(), gate.clone());

        let node_id = NodeId::from(raft_endpoint.id());
        let consensus = ConsensusHandle::new(
            node_id,
            raft_config(),
            RaftTransport::new(),
            log_store,
            state_machine,
        )
        .await?;

        let raft_listener = RaftListener::spawn(
            consensus.raft().clone(),
            bind.consensus_endpoint().socket_addr()?,
        )
        .await?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            real_addr,
            store,
            gate,
            gossip,
            consensus,
            raft_listener: Arc::new(raft_listener),
            shutdown_tx,
        })
    }

    /// Join `peers`, or bootstrap a singleton cluster when none are given,
    /// then pump membership events until [`Engine::close`] or a fatal
    /// error.
    ///
    /// Joining nodes do not bootstrap: their consensus state arrives via a
    /// snapshot installed by the existing cluster's leader.
    pub async fn start(&self, peers: Vec<String>) -> EngineResult<()> {
        if peers.is_empty() {
            let node_id = self.consensus.node_id().clone();
            let node = Node::new(node_id.as_str());
            self.consensus
                .bootstrap(BTreeMap::from([(node_id, node)]))
                .await?;
        } else {
            let joined = self.gossip.join(&peers).await?;
            info!("joined {joined} seed(s)");
        }

        self.run_event_pump().await
    }

    async fn run_event_pump(&self) -> EngineResult<()> {
        let mut events = self
            .gossip
            .take_event_receiver()
            .await
            .ok_or_else(|| Error::Config("engine already started".to_string()))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("event pump stopped");
                    return Ok(());
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Error::EventChannelClosed);
                    };
                    self.handle_event(event).await?;
                }
            }
        }
    }

    /// Dispatch one membership event.
    ///
    /// Membership changes go through a single serialiser, the leader;
    /// followers observe the same events and drop them, which also keeps a
    /// broadcast command from being submitted to the log more than once.
    async fn handle_event(&self, event: Event) -> EngineResult<()> {
        if !self.consensus.is_leader().await {
            debug!("not the leader, ignoring event");
            return Ok(());
        }

        match event {
            Event::MemberJoin(member) => {
                let endpoint = member.addr.consensus_endpoint();
                self.consensus
                    .add_voter(NodeId::from(endpoint.id()), Node::new(endpoint.id()))
                    .await?;
            }
            Event::MemberLeave(member) | Event::MemberFailed(member) | Event::MemberReap(member) => {
                let endpoint = member.addr.consensus_endpoint();
                self.consensus
                    .remove_server(&NodeId::from(endpoint.id()))
                    .await?;
            }
            Event::User { name, payload } if name == APPLY_EVENT => {
                match serde_json::from_slice::<Command>(&payload) {
                    // Apply errors are transient; convergence comes from
                    // retries at higher layers.
                    Ok(command) => {
                        if let Err(e) = self.consensus.apply(command, RAFT_TIMEOUT).await {
                            debug!("apply failed: {e}");
                        }
                    }
                    Err(e) => warn!("malformed command payload, ignoring: {e}"),
                }
            }
            Event::User { name, .. } => debug!(event = %name, "ignoring foreign user event"),
        }
        Ok(())
    }

    /// Read a value from the locally-applied state.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> EngineResult<T> {
        let _guard = self.gate.read().await;
        Ok(self.store.get(key)?)
    }

    /// List locally-applied values whose keys match any of `patterns`, in
    /// key order.
    pub async fn list<T: DeserializeOwned>(&self, patterns: &[&str]) -> EngineResult<Vec<T>> {
        let _guard = self.gate.read().await;
        Ok(self.store.list(patterns)?)
    }

    /// Every key/value pair as raw strings, at engine-level consistency.
    pub fn list_raw(&self) -> EngineResult<std::collections::BTreeMap<String, String>> {
        Ok(self.store.list_raw()?)
    }

    /// Replicate a write across the cluster.
    ///
    /// Fire-and-forget: returns once the broadcast is accepted by the
    /// local gossip node, without waiting for the apply.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        let value = serde_json::to_value(value).map_err(Error::Encode)?;
        let command = Command::set(key, value, self.real_addr.consensus_endpoint().id());
        self.broadcast(command).await
    }

    /// Replicate a delete across the cluster. Fire-and-forget like
    /// [`Engine::set`].
    pub async fn delete(&self, key: &str) -> EngineResult<()> {
        let command = Command::delete(key, self.real_addr.consensus_endpoint().id());
        self.broadcast(command).await
    }

    async fn broadcast(&self, command: Command) -> EngineResult<()> {
        let payload = serde_json::to_vec(&command).map_err(Error::Encode)?;
        self.gossip.user_event(APPLY_EVENT, payload, false).await?;
        Ok(())
    }

    /// The consensus endpoints of the current voter configuration.
    pub fn members(&self) -> EngineResult<Vec<Address>> {
        let voters: BTreeSet<NodeId> = self.consensus.voter_ids();
        voters
            .into_iter()
            .map(|id| Address::parse(id.as_str()).map_err(Error::Membership))
            .collect()
    }

    /// Whether this node currently leads the cluster.
    pub async fn is_leader(&self) -> bool {
        self.consensus.is_leader().await
    }

    /// Shut the node down: membership first, then consensus, then the
    /// local store.
    pub async fn close(&self) -> EngineResult<()> {
        info!("closing replikv node");

        self.gossip.leave().await;
        self.gossip.shutdown();
        let _ = self.shutdown_tx.send(());

        self.raft_listener.shutdown();
        self.consensus.shutdown().await?;

        self.store.close()?;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("real_addr", &self.real_addr)
            .finish_non_exhaustive()
    }
}

/// Wipe and recreate the per-node consensus state directory.
///
/// The node always rejoins from an empty log and catches up via a
/// leader-installed snapshot; only the local data file is persistent.
fn prepare_state_dir(base: &Path, node_hash: &str) -> EngineResult<PathBuf> {
    let dir = base.join(node_hash);

    match std::fs::remove_dir_all(&dir) {
        Ok(()) => debug!(dir = %dir.display(), "wiped consensus state"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Config(format!(
                "cannot wipe consensus state dir {}: {e}",
                dir.display()
            )));
        }
    }
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777))?;
    }

    Ok(dir)
}
