//! Membership events delivered to the embedding application.

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// A peer known to the gossip layer.
///
/// The name is the string form of the peer's real (advertised) endpoint, so
/// its consensus endpoint is always derivable by adding one to the port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Node name, equal to `addr.id()`.
    pub name: String,
    /// The endpoint peers should contact.
    pub addr: Address,
}

impl Member {
    /// Build the member record for an endpoint.
    pub fn new(addr: Address) -> Self {
        Self {
            name: addr.id(),
            addr,
        }
    }
}

/// Liveness of a tracked member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Heartbeats are arriving.
    Alive,
    /// No traffic within the failure timeout.
    Failed,
}

/// Asynchronous cluster event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer joined the cluster (includes the local node itself).
    MemberJoin(Member),
    /// A peer departed gracefully.
    MemberLeave(Member),
    /// A peer stopped responding.
    MemberFailed(Member),
    /// A failed peer was dropped from the member table.
    MemberReap(Member),
    /// An application broadcast.
    User {
        /// Event name chosen by the sender.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
}
