//! Durable object store
//!
//! The engine keeps its live tree, content index, registry and patch chain
//! in memory and persists them through a small key-value interface with
//! atomic multi-key commits. [`SledObjectStore`] is the on-disk backend;
//! [`MemoryObjectStore`] backs tests and throwaway instances.
//!
//! Values are bincode-encoded with the standard configuration (see
//! [`encode`] / [`decode`]).

use crate::error::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, trace};

/// Ordered set of puts and deletes committed together
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<(String, Option<Vec<u8>>)>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push((key.into(), Some(value)));
    }

    /// Stage a delete
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push((key.into(), None));
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged operations in order (`None` means delete)
    pub fn ops(&self) -> &[(String, Option<Vec<u8>>)] {
        &self.ops
    }
}

/// Transactional key-value store holding the engine's persistent objects
pub trait ObjectStore: Send {
    /// Read one key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All keys starting with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply every operation of `batch` atomically and make it durable
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Write a single key
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.commit(batch)
    }

    /// Delete a single key
    fn delete(&self, key: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.commit(batch)
    }
}

/// Encode a value for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

/// Decode a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// sled-backed store
pub struct SledObjectStore {
    db: sled::Db,
}

impl SledObjectStore {
    /// Open (or create) the database directory at `path`
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening object store at {:?}", path);
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl ObjectStore for SledObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.db
            .scan_prefix(prefix.as_bytes())
            .map(|item| {
                let (key, value) = item?;
                Ok((String::from_utf8_lossy(&key).into_owned(), value.to_vec()))
            })
            .collect()
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        let mut sled_batch = sled::Batch::default();
        for (key, value) in batch.ops {
            match value {
                Some(value) => sled_batch.insert(key.as_bytes(), value),
                None => sled_batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(sled_batch)?;
        self.db.flush()?;
        trace!("Committed {} object store operations", count);
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryObjectStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    commits: Mutex<usize>,
}

impl MemoryObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty commits applied so far
    pub fn commit_count(&self) -> usize {
        *self.commits.lock()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no key
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.lock();
        for (key, value) in batch.ops {
            match value {
                Some(value) => entries.insert(key, value),
                None => entries.remove(&key),
            };
        }
        *self.commits.lock() += 1;
        Ok(())
    }
}
