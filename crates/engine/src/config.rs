//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use replikv_membership::Address;
use replikv_store::StoreOptions;

/// Name of the gossip user event carrying replicated commands.
pub(crate) const APPLY_EVENT: &str = "replikv:apply";

/// Time the leader waits for an apply to commit and reach its state machine.
pub(crate) const RAFT_TIMEOUT: Duration = Duration::from_secs(10);

/// File name of the consensus database inside the per-node state directory.
pub(crate) const RAFT_DB_FILE: &str = "raft.db";

/// Configuration for an [`Engine`](crate::Engine) node.
#[derive(Debug)]
pub struct EngineConfig {
    /// Endpoint the gossip layer binds. Consensus binds the sibling
    /// endpoint one port above.
    pub bind: Address,
    /// Endpoint peers should contact, when it differs from `bind` (NAT).
    pub advertise: Option<Address>,
    /// Local store options. The path is required.
    pub store: StoreOptions,
    /// Base directory for the per-node consensus state. The node's
    /// subdirectory is wiped on every start.
    pub state_dir: PathBuf,
}

impl EngineConfig {
    /// Configuration for a node listening on `bind` with its local store
    /// at `store`.
    pub fn new(bind: Address, store: StoreOptions) -> Self {
        Self {
            bind,
            advertise: None,
            store,
            state_dir: PathBuf::from("/tmp"),
        }
    }

    /// The endpoint other nodes reach this one on.
    pub fn real_addr(&self) -> &Address {
        self.advertise.as_ref().unwrap_or(&self.bind)
    }
}
