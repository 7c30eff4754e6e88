//! RocksDB storage for the replicated log and stable state.
//!
//! The per-node consensus database holds three column families: `logs`
//! (entries keyed by big-endian index), `meta` (vote and last-purged id)
//! and `snapshots` (owned by the state machine).

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{AnyError, Entry, ErrorSubject, ErrorVerb, LogId, StorageError, StorageIOError, Vote};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tracing::debug;

use crate::error::{ConsensusResult, Error};
use crate::types::{NodeId, TypeConfig};

pub(crate) const CF_META: &str = "meta";
pub(crate) const CF_LOGS: &str = "logs";
pub(crate) const CF_SNAPSHOTS: &str = "snapshots";

/// The engine behind the consensus log, stable state and snapshots.
pub type ConsensusDb = DBWithThreadMode<MultiThreaded>;

/// Open the per-node consensus database with its column families.
pub fn open_raft_db(path: impl AsRef<Path>) -> ConsensusResult<Arc<ConsensusDb>> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ColumnFamilyDescriptor::new(CF_LOGS, Options::default()),
        ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Options::default()),
    ];

    let db = ConsensusDb::open_cf_descriptors(&opts, path.as_ref(), cfs)
        .map_err(|e| Error::Storage(format!("failed to open consensus db: {e}")))?;
    Ok(Arc::new(db))
}

/// RocksDB-backed log and stable store.
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Arc<ConsensusDb>,
}

impl LogStore {
    /// Log store over an opened consensus database.
    pub fn new(db: Arc<ConsensusDb>) -> Self {
        Self { db }
    }

    fn cf_meta(&self) -> Arc<BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_META)
            .expect("column family `meta` not found")
    }

    fn cf_logs(&self) -> Arc<BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_LOGS)
            .expect("column family `logs` not found")
    }

    /// Get a store metadata value.
    fn get_meta<M: meta::StoreMeta>(&self) -> Result<Option<M::Value>, StorageError<NodeId>> {
        let bytes = self
            .db
            .get_cf(&self.cf_meta(), M::KEY)
            .map_err(M::read_err)?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let value = serde_json::from_slice(&bytes).map_err(M::read_err)?;
        Ok(Some(value))
    }

    /// Save a store metadata value.
    fn put_meta<M: meta::StoreMeta>(&self, value: &M::Value) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value).map_err(|e| M::write_err(value, e))?;
        self.db
            .put_cf(&self.cf_meta(), M::KEY, bytes)
            .map_err(|e| M::write_err(value, e))?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(x) => id_to_bin(*x),
            Bound::Excluded(x) => id_to_bin(*x + 1),
            Bound::Unbounded => id_to_bin(0),
        };

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            &self.cf_logs(),
            IteratorMode::From(&start, Direction::Forward),
        );
        for item in iter {
            let (id, value) = item.map_err(read_logs_err)?;

            let id = bin_to_id(&id);
            if !range.contains(&id) {
                break;
            }

            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(read_logs_err)?;
            debug_assert_eq!(id, entry.log_id.index);

            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self
            .db
            .iterator_cf(&self.cf_logs(), IteratorMode::End)
            .next();

        let last_log_id = match last {
            Some(item) => {
                let (_, bytes) = item.map_err(read_logs_err)?;
                let entry =
                    serde_json::from_slice::<Entry<TypeConfig>>(&bytes).map_err(read_logs_err)?;
                Some(entry.log_id)
            }
            None => None,
        };

        let last_purged_log_id = self.get_meta::<meta::LastPurged>()?;
        let last_log_id = last_log_id.or_else(|| last_purged_log_id.clone());

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.put_meta::<meta::SavedVote>(vote)?;
        self.db.flush_wal(true).map_err(write_vote_err)?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.get_meta::<meta::SavedVote>()
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            let id = id_to_bin(entry.log_id.index);
            self.db
                .put_cf(
                    &self.cf_logs(),
                    id,
                    serde_json::to_vec(&entry).map_err(write_logs_err)?,
                )
                .map_err(write_logs_err)?;
        }

        self.db.flush_wal(true).map_err(write_logs_err)?;

        // If there is an error, the callback is dropped.
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("truncate: [{:?}, +oo)", log_id);

        let from = id_to_bin(log_id.index);
        let to = id_to_bin(u64::MAX);
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(&self.cf_logs(), from, to);
        self.db.write(batch).map_err(write_logs_err)?;

        self.db.flush_wal(true).map_err(write_logs_err)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("purge: [0, {:?}]", log_id);

        // Write the last-purged id before deleting the entries.
        self.put_meta::<meta::LastPurged>(&log_id)?;

        let from = id_to_bin(0);
        let to = id_to_bin(log_id.index + 1);
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(&self.cf_logs(), from, to);
        self.db.write(batch).map_err(write_logs_err)?;

        Ok(())
    }
}

/// Metadata storage definitions.
mod meta {
    use openraft::{AnyError, ErrorSubject, ErrorVerb, LogId, StorageError, StorageIOError, Vote};

    use crate::types::NodeId;

    /// Defines a metadata key and value.
    pub(crate) trait StoreMeta {
        /// The key used to store the value in the meta column family.
        const KEY: &'static str;

        /// The type of the stored value.
        type Value: serde::Serialize + serde::de::DeserializeOwned;

        /// The error subject this metadata belongs to.
        fn subject(v: Option<&Self::Value>) -> ErrorSubject<NodeId>;

        fn read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
            StorageIOError::new(Self::subject(None), ErrorVerb::Read, AnyError::new(&e)).into()
        }

        fn write_err(v: &Self::Value, e: impl std::error::Error + 'static) -> StorageError<NodeId> {
            StorageIOError::new(Self::subject(Some(v)), ErrorVerb::Write, AnyError::new(&e)).into()
        }
    }

    pub(crate) struct LastPurged {}
    pub(crate) struct SavedVote {}

    impl StoreMeta for LastPurged {
        const KEY: &'static str = "last_purged_log_id";
        type Value = LogId<NodeId>;

        fn subject(_v: Option<&Self::Value>) -> ErrorSubject<NodeId> {
            ErrorSubject::Store
        }
    }

    impl StoreMeta for SavedVote {
        const KEY: &'static str = "vote";
        type Value = Vote<NodeId>;

        fn subject(_v: Option<&Self::Value>) -> ErrorSubject<NodeId> {
            ErrorSubject::Vote
        }
    }
}

/// Converts an index to a byte key. Big-endian keeps engine iteration in
/// index order.
pub(crate) fn id_to_bin(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub(crate) fn bin_to_id(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[0..8]);
    u64::from_be_bytes(bytes)
}

fn read_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Logs, ErrorVerb::Read, AnyError::new(&e)).into()
}

fn write_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Logs, ErrorVerb::Write, AnyError::new(&e)).into()
}

fn write_vote_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Vote, ErrorVerb::Write, AnyError::new(&e)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    use openraft::{CommittedLeaderId, EntryPayload};
    use tempfile::tempdir;

    use crate::types::Command;

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(
            CommittedLeaderId::new(1, NodeId::from("127.0.0.1:7001")),
            index,
        )
    }

    fn entry(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(Command::delete(format!("k{index}"), "127.0.0.1:7001")),
        }
    }

    /// Seed the logs column family in the on-disk format `append` writes.
    fn seed(store: &LogStore, entries: &[Entry<TypeConfig>]) {
        for entry in entries {
            store
                .db
                .put_cf(
                    &store.cf_logs(),
                    id_to_bin(entry.log_id.index),
                    serde_json::to_vec(entry).unwrap(),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn stored_entries_can_be_read_back() {
        let dir = tempdir().unwrap();
        let db = open_raft_db(dir.path()).unwrap();
        let mut store = LogStore::new(db);

        seed(&store, &[entry(1), entry(2), entry(3)]);

        let read = store.try_get_log_entries(2..=3).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].log_id.index, 2);
        assert_eq!(read[1].log_id.index, 3);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(3)));
        assert_eq!(state.last_purged_log_id, None);
    }

    #[tokio::test]
    async fn truncate_drops_the_suffix() {
        let dir = tempdir().unwrap();
        let db = open_raft_db(dir.path()).unwrap();
        let mut store = LogStore::new(db);

        seed(&store, &[entry(1), entry(2), entry(3)]);
        store.truncate(log_id(2)).await.unwrap();

        let read = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].log_id.index, 1);
    }

    #[tokio::test]
    async fn purge_drops_the_prefix_and_remembers_it() {
        let dir = tempdir().unwrap();
        let db = open_raft_db(dir.path()).unwrap();
        let mut store = LogStore::new(db);

        seed(&store, &[entry(1), entry(2), entry(3)]);
        store.purge(log_id(2)).await.unwrap();

        let read = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].log_id.index, 3);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(2)));
        assert_eq!(state.last_log_id, Some(log_id(3)));
    }

    #[tokio::test]
    async fn vote_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let vote = Vote::new(7, NodeId::from("127.0.0.1:7001"));

        {
            let db = open_raft_db(dir.path()).unwrap();
            let mut store = LogStore::new(db);
            store.save_vote(&vote).await.unwrap();
        }

        let db = open_raft_db(dir.path()).unwrap();
        let mut store = LogStore::new(db);
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }
}
