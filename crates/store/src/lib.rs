//! Embedded persistent key/value store backed by RocksDB.
//!
//! A [`LocalStore`] holds exactly one bucket (a column family) mapping opaque
//! keys to JSON-encoded values. Writes go through atomic engine writes with
//! an optional fsync; reads and iteration run concurrently with the writer.

mod error;

pub use error::{Error, Result};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use glob::Pattern;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch, WriteOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Name of the bucket used when none is configured.
pub const DEFAULT_BUCKET: &str = "default";

/// Configuration used to open a [`LocalStore`].
#[derive(Default)]
pub struct StoreOptions {
    /// Database directory. Required.
    pub path: Option<PathBuf>,
    /// Bucket to create at open time. Defaults to [`DEFAULT_BUCKET`].
    pub bucket: Option<String>,
    /// Skip fsync after each write. Unsafe, use with caution.
    pub no_sync: bool,
    /// Engine-specific options passed through to RocksDB.
    pub db_options: Option<Options>,
}

impl StoreOptions {
    /// Options for a store at `path`, everything else defaulted.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    fn bucket(&self) -> &str {
        self.bucket.as_deref().unwrap_or(DEFAULT_BUCKET)
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("path", &self.path)
            .field("bucket", &self.bucket)
            .field("no_sync", &self.no_sync)
            .finish_non_exhaustive()
    }
}

/// An embedded persistent dictionary.
///
/// Cloning is cheap and every clone operates on the same database handle.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    bucket: String,
    sync_writes: bool,
}

impl LocalStore {
    /// Open the database at `options.path` and ensure the bucket exists.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let path = options.path.clone().ok_or(Error::MissingPath)?;
        let bucket = options.bucket().to_string();

        let mut db_opts = options.db_options.unwrap_or_default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Reopening must list the column families already present, or the
        // engine refuses to open the database.
        let mut cf_names = match DBWithThreadMode::<MultiThreaded>::list_cf(&db_opts, &path) {
            Ok(existing) if !existing.is_empty() => existing,
            _ => vec![DEFAULT_BUCKET.to_string()],
        };
        if !cf_names.iter().any(|name| name == &bucket) {
            cf_names.push(bucket.clone());
        }

        let cfs: Vec<ColumnFamilyDescriptor> = cf_names
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&db_opts, &path, cfs)?;
        debug!(path = %path.display(), %bucket, "opened local store");

        Ok(Self {
            db: Arc::new(db),
            bucket,
            sync_writes: !options.no_sync,
        })
    }

    fn cf(&self) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(&self.bucket)
            .ok_or_else(|| Error::BucketMissing(self.bucket.clone()))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    /// Retrieve and decode the value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get_raw(key)?;
        serde_json::from_slice(&raw).map_err(Error::Decode)
    }

    /// Retrieve the raw encoded bytes stored under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        let cf = self.cf()?;
        self.db
            .get_cf(&cf, key.as_bytes())?
            .ok_or(Error::KeyNotFound)
    }

    /// Encode `value` and store it under `key` atomically.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(Error::Encode)?;
        self.set_raw(key, raw)
    }

    /// Store already-encoded bytes under `key` atomically.
    pub fn set_raw(&self, key: &str, raw: Vec<u8>) -> Result<()> {
        let cf = self.cf()?;
        self.db
            .put_cf_opt(&cf, key.as_bytes(), raw, &self.write_opts())?;
        Ok(())
    }

    /// Remove `key`. Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(&cf, key.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    /// Decode every value whose key matches any of `patterns`, in
    /// lexicographic key order.
    ///
    /// Patterns use shell-glob semantics (`*`, `?`, character classes); with
    /// no patterns every non-empty key matches.
    pub fn list<T: DeserializeOwned>(&self, patterns: &[&str]) -> Result<Vec<T>> {
        let compiled: Vec<Pattern> = patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        let match_all = patterns.is_empty();

        let cf = self.cf()?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, raw) = item?;
            let key = String::from_utf8_lossy(&key);
            if !key_matches(&key, &compiled, match_all) {
                continue;
            }
            values.push(serde_json::from_slice(&raw).map_err(Error::Decode)?);
        }
        Ok(values)
    }

    /// Every key/value pair as raw strings, without decoding.
    pub fn list_raw(&self) -> Result<BTreeMap<String, String>> {
        let cf = self.cf()?;
        let mut entries = BTreeMap::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, raw) = item?;
            let key = String::from_utf8(key.into_vec())
                .map_err(|e| Error::RawEncoding(String::from_utf8_lossy(e.as_bytes()).into()))?;
            let value = String::from_utf8(raw.into_vec())
                .map_err(|_| Error::RawEncoding(key.clone()))?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    /// Remove every entry in the bucket.
    pub fn clear(&self) -> Result<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(&cf, key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Force the write-ahead log to disk. Only necessary when the store was
    /// opened with `no_sync`.
    pub fn sync(&self) -> Result<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }

    /// Flush outstanding writes. The file lock is released once the last
    /// clone of this store is dropped.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("bucket", &self.bucket)
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}

fn key_matches(key: &str, patterns: &[Pattern], match_all: bool) -> bool {
    if key.is_empty() {
        return false;
    }
    if match_all {
        return true;
    }
    patterns.iter().any(|p| p.matches(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        value: i64,
    }

    fn open(dir: &tempfile::TempDir) -> LocalStore {
        LocalStore::open(StoreOptions::new(dir.path())).unwrap()
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = LocalStore::open(StoreOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MissingPath));
    }

    #[test]
    fn set_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        let payload = Payload {
            name: "toto".into(),
            value: 42,
        };
        store.set("toto_42", &payload).unwrap();

        let read: Payload = store.get("toto_42").unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn get_missing_key() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        let err = store.get::<Payload>("nope").unwrap_err();
        assert!(matches!(err, Error::KeyNotFound));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        store.set("gone", &1u32).unwrap();
        store.delete("gone").unwrap();
        store.delete("gone").unwrap();

        assert!(matches!(
            store.get::<u32>("gone").unwrap_err(),
            Error::KeyNotFound
        ));
    }

    #[test]
    fn list_filters_by_glob_in_key_order() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        store.set("toto_2", &2u32).unwrap();
        store.set("titi_3", &3u32).unwrap();
        store.set("toto_1", &1u32).unwrap();

        let matched: Vec<u32> = store.list(&["toto_*"]).unwrap();
        assert_eq!(matched, vec![1, 2]);

        let all: Vec<u32> = store.list(&[]).unwrap();
        assert_eq!(all, vec![3, 1, 2]);
    }

    #[test]
    fn list_matches_any_pattern() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        store.set("alpha_1", &1u32).unwrap();
        store.set("beta_2", &2u32).unwrap();
        store.set("gamma_3", &3u32).unwrap();

        let matched: Vec<u32> = store.list(&["alpha_*", "gamma_?"]).unwrap();
        assert_eq!(matched, vec![1, 3]);
    }

    #[test]
    fn list_raw_returns_encoded_values() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        store.set("k", &true).unwrap();

        let raw = store.list_raw().unwrap();
        assert_eq!(raw.get("k").map(String::as_str), Some("true"));
    }

    #[test]
    fn clear_empties_the_bucket() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        store.set("a", &1u32).unwrap();
        store.set("b", &2u32).unwrap();
        store.clear().unwrap();

        assert!(store.list_raw().unwrap().is_empty());
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(&dir);
            store.set("persist", &7u32).unwrap();
            store.close().unwrap();
        }

        let store = open(&dir);
        let read: u32 = store.get("persist").unwrap();
        assert_eq!(read, 7);
    }

    #[test]
    fn custom_bucket_is_created() {
        let dir = tempdir().unwrap();
        let options = StoreOptions {
            bucket: Some("alt".into()),
            ..StoreOptions::new(dir.path())
        };
        let store = LocalStore::open(options).unwrap();

        store.set("k", &1u32).unwrap();
        assert_eq!(store.get::<u32>("k").unwrap(), 1);
    }
}
