//! Local key-value storage underneath the table store.
//!
//! Every node owns one [`KvStore`]. Raft decides the order of writes; this
//! module only has to make each write atomic and each read consistent.
//!
//! Two backends implement the trait:
//! - [`MemStore`]: a `BTreeMap` behind a lock, used for tests and `--in-memory`
//! - [`FjallStore`]: a single `fjall` partition on disk

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::error::SqlError;

/// A set of puts that become visible together or not at all.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.puts.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }
}

/// Transactional get/put/scan-by-prefix store.
///
/// `scan_prefix` returns entries in ascending key order and observes a single
/// committed state: a concurrent `commit` is either fully visible or not at all.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SqlError>;

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SqlError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), SqlError>;

    /// Removes every key. Used once at startup to begin from a clean state.
    fn clear(&self) -> Result<(), SqlError>;
}

/// In-memory store.
///
/// BTreeMap keeps keys ordered, which is exactly what prefix scans need and
/// makes two stores trivially comparable in tests.
#[derive(Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    fn poisoned() -> SqlError {
        SqlError::Storage("memory store lock poisoned".to_string())
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SqlError> {
        let data = self.data.read().map_err(|_| Self::poisoned())?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SqlError> {
        let data = self.data.read().map_err(|_| Self::poisoned())?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), SqlError> {
        let mut data = self.data.write().map_err(|_| Self::poisoned())?;
        for (key, value) in batch.puts {
            data.insert(key, value);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), SqlError> {
        self.data.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}

/// On-disk store backed by one `fjall` partition.
pub struct FjallStore {
    keyspace: Keyspace,
    data: PartitionHandle,
}

impl FjallStore {
    const PARTITION: &'static str = "data";

    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SqlError> {
        let keyspace = fjall::Config::new(dir.as_ref()).open()?;
        let data = keyspace.open_partition(Self::PARTITION, PartitionCreateOptions::default())?;
        Ok(Self { keyspace, data })
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> Result<(), SqlError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

impl KvStore for FjallStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SqlError> {
        Ok(self.data.get(key)?.map(|value| value.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SqlError> {
        let mut entries = Vec::new();
        for item in self.data.prefix(prefix) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), SqlError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.keyspace.batch();
        for (key, value) in batch.puts {
            tx.insert(&self.data, key, value);
        }
        tx.commit()?;
        self.persist()
    }

    fn clear(&self) -> Result<(), SqlError> {
        let mut tx = self.keyspace.batch();
        for item in self.data.iter() {
            let (key, _) = item?;
            tx.remove(&self.data, key.to_vec());
        }
        tx.commit()?;
        self.persist()
    }
}
