//! Gossip-based membership for a replicated store cluster.
//!
//! Nodes discover each other through TCP gossip, watch each other's
//! liveness, and flood application broadcasts (user events) to every member.
//! Cluster changes and broadcasts are delivered as asynchronous [`Event`]s
//! on a bounded channel.

mod address;
mod error;
mod event;
mod gossip;
mod message;

pub use address::Address;
pub use error::{Error, Result};
pub use event::{Event, Member, MemberStatus};
pub use gossip::{EVENT_CHANNEL_CAPACITY, Gossip, GossipConfig};
