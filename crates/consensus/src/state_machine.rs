//! State machine applying committed commands to the local store.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    AnyError, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership,
};
use rocksdb::IteratorMode;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use replikv_store::LocalStore;

use crate::log_store::{CF_SNAPSHOTS, ConsensusDb, id_to_bin};
use crate::types::{Command, CommandResponse, Node, NodeId, Op, TypeConfig};

/// Snapshots retained in the snapshots column family.
const SNAPSHOT_RETENTION: usize = 2;

/// Raw snapshot payload: every key mapped to its already-encoded value.
type SnapshotData = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct AppliedState {
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, Node>,
}

/// Replicated state machine.
///
/// Holds a non-owning handle to the coordinator's store and materialises
/// every committed command into it. The gate lock is shared with the
/// coordinator so public reads never interleave with apply, snapshot
/// capture or restore.
#[derive(Clone)]
pub struct KvStateMachine {
    db: Arc<ConsensusDb>,
    store: LocalStore,
    gate: Arc<RwLock<()>>,
    applied: Arc<RwLock<AppliedState>>,
}

impl KvStateMachine {
    /// Build the state machine over the consensus database and the local
    /// store, sharing `gate` with the coordinator.
    pub fn new(db: Arc<ConsensusDb>, store: LocalStore, gate: Arc<RwLock<()>>) -> Self {
        Self {
            db,
            store,
            gate,
            applied: Arc::new(RwLock::new(AppliedState::default())),
        }
    }

    fn apply_command(&self, command: Command, sequence: u64) -> CommandResponse {
        debug!(op = ?command.op, key = %command.key, "applying command");

        let result = match command.op {
            Op::Set => match command.value {
                Some(value) => match serde_json::to_vec(&value) {
                    Ok(raw) => self.store.set_raw(&command.key, raw),
                    Err(e) => {
                        warn!(key = %command.key, "unencodable value: {e}");
                        return CommandResponse::failed(sequence, e.to_string());
                    }
                },
                None => {
                    warn!(key = %command.key, "set command without a value, ignoring");
                    return CommandResponse::applied(sequence);
                }
            },
            Op::Del => self.store.delete(&command.key),
        };

        // A committed entry cannot be failed cluster-wide; report the local
        // engine error to the proposer and keep replicating.
        match result {
            Ok(()) => CommandResponse::applied(sequence),
            Err(e) => {
                warn!(key = %command.key, "local apply failed: {e}");
                CommandResponse::failed(sequence, e.to_string())
            }
        }
    }

    fn snapshot_data(&self) -> Result<Vec<u8>, StorageError<NodeId>> {
        let data: SnapshotData = self.store.list_raw().map_err(sm_read_err)?;
        serde_json::to_vec(&data).map_err(sm_read_err)
    }

    /// Keep the persisted snapshot set bounded.
    fn persist_snapshot(&self, last_index: u64, bytes: &[u8]) -> Result<(), StorageError<NodeId>> {
        let cf = self
            .db
            .cf_handle(CF_SNAPSHOTS)
            .expect("column family `snapshots` not found");

        self.db
            .put_cf(&cf, id_to_bin(last_index), bytes)
            .map_err(snapshot_write_err)?;

        let keys: Vec<Box<[u8]>> = self
            .db
            .iterator_cf(&cf, IteratorMode::Start)
            .filter_map(|item| item.ok().map(|(key, _)| key))
            .collect();
        if keys.len() > SNAPSHOT_RETENTION {
            for key in &keys[..keys.len() - SNAPSHOT_RETENTION] {
                self.db.delete_cf(&cf, key).map_err(snapshot_write_err)?;
            }
        }
        Ok(())
    }

    async fn snapshot_meta(&self) -> SnapshotMeta<NodeId, Node> {
        let applied = self.applied.read().await;
        SnapshotMeta {
            last_log_id: applied.last_applied_log.clone(),
            last_membership: applied.last_membership.clone(),
            snapshot_id: format!(
                "snapshot-{}",
                applied.last_applied_log.as_ref().map_or(0, |id| id.index)
            ),
        }
    }
}

impl RaftStateMachine<TypeConfig> for KvStateMachine {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        let applied = self.applied.read().await;
        Ok((
            applied.last_applied_log.clone(),
            applied.last_membership.clone(),
        ))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let _guard = self.gate.write().await;
        let mut applied = self.applied.write().await;

        let mut responses = Vec::new();
        for entry in entries {
            let log_id = entry.log_id;
            applied.last_applied_log = Some(log_id.clone());

            match entry.payload {
                EntryPayload::Blank => responses.push(CommandResponse::applied(log_id.index)),
                EntryPayload::Normal(command) => {
                    responses.push(self.apply_command(command, log_id.index));
                }
                EntryPayload::Membership(membership) => {
                    applied.last_membership = StoredMembership::new(Some(log_id.clone()), membership);
                    responses.push(CommandResponse::applied(log_id.index));
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            state_machine: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let _guard = self.gate.write().await;
        let mut applied = self.applied.write().await;
        applied.last_applied_log = meta.last_log_id.clone();
        applied.last_membership = meta.last_membership.clone();

        let bytes = snapshot.into_inner();
        if bytes.is_empty() {
            return Ok(());
        }

        let data: SnapshotData = serde_json::from_slice(&bytes).map_err(snapshot_read_err)?;

        // Restore is destructive: the bucket is rebuilt from the snapshot.
        self.store.clear().map_err(sm_write_err)?;
        for (key, raw) in data {
            self.store
                .set_raw(&key, raw.into_bytes())
                .map_err(sm_write_err)?;
        }

        let last_index = meta.last_log_id.as_ref().map_or(0, |id| id.index);
        self.persist_snapshot(last_index, &bytes)?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let _guard = self.gate.write().await;
        let meta = self.snapshot_meta().await;
        let bytes = self.snapshot_data()?;

        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }
}

/// Builds a point-in-time snapshot decoupled from live state.
pub struct KvSnapshotBuilder {
    state_machine: KvStateMachine,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let _guard = self.state_machine.gate.write().await;
        let meta = self.state_machine.snapshot_meta().await;
        let bytes = self.state_machine.snapshot_data()?;

        let last_index = meta.last_log_id.as_ref().map_or(0, |id| id.index);
        self.state_machine.persist_snapshot(last_index, &bytes)?;

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

fn sm_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        AnyError::new(&e),
    )
    .into()
}

fn sm_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        AnyError::new(&e),
    )
    .into()
}

fn snapshot_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Snapshot(None), ErrorVerb::Read, AnyError::new(&e)).into()
}

fn snapshot_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(
        ErrorSubject::Snapshot(None),
        ErrorVerb::Write,
        AnyError::new(&e),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    use openraft::CommittedLeaderId;
    use tempfile::tempdir;

    use crate::log_store::open_raft_db;
    use replikv_store::StoreOptions;

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(
            CommittedLeaderId::new(1, NodeId::from("127.0.0.1:7001")),
            index,
        )
    }

    fn command_entry(index: u64, command: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(command),
        }
    }

    struct Fixture {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        store: LocalStore,
        state_machine: KvStateMachine,
    }

    fn fixture() -> Fixture {
        let store_dir = tempdir().unwrap();
        let raft_dir = tempdir().unwrap();
        let store = LocalStore::open(StoreOptions::new(store_dir.path())).unwrap();
        let db = open_raft_db(raft_dir.path()).unwrap();
        let state_machine =
            KvStateMachine::new(db, store.clone(), Arc::new(RwLock::new(())));
        Fixture {
            _dirs: (store_dir, raft_dir),
            store,
            state_machine,
        }
    }

    #[tokio::test]
    async fn set_and_del_commands_mutate_the_store() {
        let mut fx = fixture();

        let responses = fx
            .state_machine
            .apply([
                command_entry(
                    1,
                    Command::set("alpha_1", serde_json::json!({"n": 1}), "127.0.0.1:7001"),
                ),
                command_entry(
                    2,
                    Command::set("alpha_2", serde_json::json!({"n": 2}), "127.0.0.1:7001"),
                ),
                command_entry(3, Command::delete("alpha_1", "127.0.0.1:7001")),
            ])
            .await
            .unwrap();

        assert!(responses.iter().all(|r| r.success));

        let raw = fx.store.list_raw().unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw.get("alpha_2").map(String::as_str), Some(r#"{"n":2}"#));

        let (last_applied, _) = fx.state_machine.applied_state().await.unwrap();
        assert_eq!(last_applied, Some(log_id(3)));
    }

    #[tokio::test]
    async fn set_without_a_value_is_a_no_op() {
        let mut fx = fixture();

        let mut command = Command::set("k", serde_json::json!(1), "127.0.0.1:7001");
        command.value = None;

        let responses = fx
            .state_machine
            .apply([command_entry(1, command)])
            .await
            .unwrap();

        assert!(responses[0].success);
        assert!(fx.store.list_raw().unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_an_identical_store() {
        let mut fx = fixture();

        fx.state_machine
            .apply([
                command_entry(
                    1,
                    Command::set("toto_1", serde_json::json!({"n": 1}), "127.0.0.1:7001"),
                ),
                command_entry(
                    2,
                    Command::set("toto_2", serde_json::json!({"n": 2}), "127.0.0.1:7001"),
                ),
            ])
            .await
            .unwrap();

        let snapshot = {
            let mut builder = fx.state_machine.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap()
        };

        // Snapshots are decoupled from live state: mutate after capture.
        fx.state_machine
            .apply([command_entry(3, Command::delete("toto_1", "127.0.0.1:7001"))])
            .await
            .unwrap();

        let mut fresh = fixture();
        fresh
            .state_machine
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let restored = fresh.store.list_raw().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("toto_1").map(String::as_str), Some(r#"{"n":1}"#));
        assert_eq!(restored.get("toto_2").map(String::as_str), Some(r#"{"n":2}"#));

        let (last_applied, _) = fresh.state_machine.applied_state().await.unwrap();
        assert_eq!(last_applied, snapshot.meta.last_log_id);
    }

    #[tokio::test]
    async fn restore_replaces_existing_keys() {
        let mut fx = fixture();
        fx.state_machine
            .apply([command_entry(
                1,
                Command::set("stale", serde_json::json!(0), "127.0.0.1:7001"),
            )])
            .await
            .unwrap();

        let mut donor = fixture();
        donor
            .state_machine
            .apply([command_entry(
                1,
                Command::set("fresh", serde_json::json!(1), "127.0.0.1:7001"),
            )])
            .await
            .unwrap();
        let snapshot = {
            let mut builder = donor.state_machine.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap()
        };

        fx.state_machine
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let raw = fx.store.list_raw().unwrap();
        assert!(raw.contains_key("fresh"));
        assert!(!raw.contains_key("stale"));
    }

    #[tokio::test]
    async fn current_snapshot_reflects_the_live_store() {
        let mut fx = fixture();
        fx.state_machine
            .apply([command_entry(
                1,
                Command::set("k", serde_json::json!(true), "127.0.0.1:7001"),
            )])
            .await
            .unwrap();

        let snapshot = fx.state_machine.get_current_snapshot().await.unwrap();
        let snapshot = snapshot.unwrap();
        let data: SnapshotData =
            serde_json::from_slice(snapshot.snapshot.get_ref()).unwrap();
        assert_eq!(data.get("k").map(String::as_str), Some("true"));
    }
}
