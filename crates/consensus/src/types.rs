//! Raft type configuration and the replicated command format.

use std::fmt;
use std::io::Cursor;

use openraft::{Config, SnapshotPolicy};
use serde::{Deserialize, Serialize};

openraft::declare_raft_types!(
    /// Types for the replicated store's raft instance.
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = NodeId,
        Node = Node,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// The raft handle type used throughout the workspace.
pub type Raft = openraft::Raft<TypeConfig>;

/// Consensus identity of a node: its consensus endpoint string
/// (`"host:port"`), so the voter configuration can always be parsed back
/// into addresses.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a consensus endpoint string.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    /// The endpoint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(endpoint: &str) -> Self {
        Self(endpoint.to_string())
    }
}

impl From<String> for NodeId {
    fn from(endpoint: String) -> Self {
        Self(endpoint)
    }
}

/// Node record stored in the raft membership configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Consensus endpoint to dial, `"host:port"`.
    pub addr: String,
}

impl Node {
    /// Node record for a consensus endpoint.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

/// Mutation kind carried by a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Store a value under a key.
    Set,
    /// Remove a key.
    Del,
}

/// A replicated mutation.
///
/// This is the payload broadcast as a gossip user event, appended to the
/// raft log by the leader, and applied by every node's state machine. The
/// encoding is self-describing JSON; unknown fields are ignored for forward
/// compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Mutation kind.
    pub op: Op,
    /// Target key.
    pub key: String,
    /// Value for `set`, absent for `del`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Consensus endpoint of the originating node. Informational.
    #[serde(default, rename = "addr", skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Command {
    /// A `set` command.
    pub fn set(key: impl Into<String>, value: serde_json::Value, origin: impl Into<String>) -> Self {
        Self {
            op: Op::Set,
            key: key.into(),
            value: Some(value),
            origin: Some(origin.into()),
        }
    }

    /// A `del` command.
    pub fn delete(key: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            op: Op::Del,
            key: key.into(),
            value: None,
            origin: Some(origin.into()),
        }
    }
}

/// Outcome of applying a command, returned to the proposer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the mutation reached the local store.
    pub success: bool,
    /// Log index that carried the command.
    pub sequence: u64,
    /// Error message when the local engine rejected the mutation.
    pub error: Option<String>,
}

impl CommandResponse {
    /// Successful application at `sequence`.
    pub fn applied(sequence: u64) -> Self {
        Self {
            success: true,
            sequence,
            error: None,
        }
    }

    /// Failed application at `sequence`.
    pub fn failed(sequence: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sequence,
            error: Some(error.into()),
        }
    }
}

/// Raft configuration tuned for small LAN clusters.
pub fn raft_config() -> Config {
    Config {
        cluster_name: "replikv".to_string(),
        heartbeat_interval: 100,
        election_timeout_min: 300,
        election_timeout_max: 600,
        install_snapshot_timeout: 10_000,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(5_000),
        max_in_snapshot_log_to_keep: 1_000,
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_is_self_describing() {
        let command = Command::set("alpha_1", serde_json::json!({"n": 1}), "127.0.0.1:7001");
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(
            json,
            r#"{"op":"set","key":"alpha_1","value":{"n":1},"addr":"127.0.0.1:7001"}"#
        );
    }

    #[test]
    fn delete_omits_the_value() {
        let command = Command::delete("alpha_1", "127.0.0.1:7001");
        let json = serde_json::to_string(&command).unwrap();
        assert!(!json.contains("value"));
        assert!(json.contains(r#""op":"del""#));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let command: Command = serde_json::from_str(
            r#"{"op":"del","key":"k","addr":"127.0.0.1:7001","future_field":true}"#,
        )
        .unwrap();
        assert_eq!(command.op, Op::Del);
        assert_eq!(command.key, "k");
    }

    #[test]
    fn unknown_op_is_a_decode_error() {
        let result = serde_json::from_str::<Command>(r#"{"op":"increment","key":"k"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn node_id_parses_back_into_an_endpoint() {
        let id = NodeId::from("127.0.0.1:7001");
        assert_eq!(id.to_string(), "127.0.0.1:7001");
        assert_eq!(id.as_str(), "127.0.0.1:7001");
    }
}
