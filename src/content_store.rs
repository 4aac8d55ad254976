//! Append-only compressed content store
//!
//! Regular-file content lives in a single file. Each stored file becomes one
//! zlib stream appended at the store's logical end, and one [`ContentRecord`]
//! in the [`ContentIndex`] describing where that stream lives.
//!
//! ## Layout
//!
//! ```text
//! content.store
//! ┌──────────────┬──────────────┬──────────────┬────────
//! │ record 1     │ record 2     │ record 3     │ ...
//! │ zlib stream  │ zlib stream  │ (empty)      │
//! └──────────────┴──────────────┴──────────────┴────────
//! offset 0       r1.end         r2.end = r3.offset
//! ```
//!
//! Records are laid out back to back in id order: for consecutive records
//! `r[i].store_offset + r[i].compressed_length == r[i+1].store_offset`, and the
//! logical end of the store is the end of the last record. Zero-length
//! records (touched placeholders, empty files) occupy no bytes.
//!
//! The store never registers a record itself until its bytes were written in
//! full; bytes beyond the logical end (left by an interrupted write) are
//! truncated when the store is opened and overwritten by the next append.

use crate::compression::{CompressionEngine, CompressionStats};
use crate::error::{Result, StrataError};
use crate::types::ContentRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Index of all content records, keyed by content id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIndex {
    records: BTreeMap<u64, ContentRecord>,
    next_content_id: u64,
}

impl Default for ContentIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentIndex {
    /// Empty index; the first record gets id 1
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_content_id: 1,
        }
    }

    /// Rebuild an index from persisted records
    pub fn from_records(records: impl IntoIterator<Item = ContentRecord>) -> Self {
        let records: BTreeMap<u64, ContentRecord> =
            records.into_iter().map(|r| (r.content_id, r)).collect();
        let next_content_id = records.keys().next_back().map_or(1, |id| id + 1);
        Self {
            records,
            next_content_id,
        }
    }

    /// Id the next registered record will receive
    pub fn next_content_id(&self) -> u64 {
        self.next_content_id
    }

    /// Logical end of the store (0 when empty)
    pub fn end_offset(&self) -> u64 {
        self.records
            .values()
            .next_back()
            .map_or(0, ContentRecord::end_offset)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the index holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record
    pub fn get(&self, content_id: u64) -> Option<&ContentRecord> {
        self.records.get(&content_id)
    }

    /// Records with ids in `start..=end`, in id order
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = &ContentRecord> {
        (start <= end)
            .then(|| self.records.range(start..=end))
            .into_iter()
            .flatten()
            .map(|(_, r)| r)
    }

    /// Register a freshly written range at the current end offset
    pub fn register(&mut self, uncompressed_length: u64, compressed_length: u64) -> ContentRecord {
        let record = ContentRecord {
            content_id: self.next_content_id,
            store_offset: self.end_offset(),
            uncompressed_length,
            compressed_length,
        };
        self.records.insert(record.content_id, record);
        self.next_content_id += 1;
        record
    }

    /// Append a record that was produced elsewhere (patch import)
    ///
    /// The record must carry the next id and start exactly at the end offset.
    pub fn append_existing(&mut self, record: ContentRecord) -> Result<()> {
        if record.content_id != self.next_content_id {
            return Err(StrataError::chain(format!(
                "content id {} does not follow {}",
                record.content_id,
                self.next_content_id - 1
            )));
        }
        if record.store_offset != self.end_offset() {
            return Err(StrataError::corruption(format!(
                "content record {} starts at {} instead of {}",
                record.content_id,
                record.store_offset,
                self.end_offset()
            )));
        }
        self.records.insert(record.content_id, record);
        self.next_content_id += 1;
        Ok(())
    }

    /// Check the offset law over all records
    pub fn verify_offsets(&self) -> Result<()> {
        let mut expected = 0u64;
        for record in self.records.values() {
            if record.store_offset != expected {
                return Err(StrataError::corruption(format!(
                    "content record {} at offset {}, expected {}",
                    record.content_id, record.store_offset, expected
                )));
            }
            expected = record.end_offset();
        }
        Ok(())
    }
}

/// Append-only compressed blob file
///
/// A single handle is shared behind a mutex, so `store`/`retrieve` calls are
/// serialized even when the store is reached through a shared reference.
pub struct ContentStore {
    path: PathBuf,
    file: Mutex<File>,
    engine: Mutex<CompressionEngine>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore").field("path", &self.path).finish()
    }
}

impl ContentStore {
    /// Open (or create) the store file backing `index`
    ///
    /// Any bytes past the index's logical end are discarded. A file shorter
    /// than the logical end means records point at missing data and is
    /// reported as corruption.
    pub fn open(path: &Path, index: &ContentIndex, compression_level: u32, chunk_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StrataError::store_io("open", e))?;

        let physical = file.metadata().map_err(|e| StrataError::store_io("open", e))?.len();
        let logical = index.end_offset();
        if physical < logical {
            return Err(StrataError::corruption(format!(
                "content store {:?} holds {} bytes but the index expects {}",
                path, physical, logical
            )));
        }
        if physical > logical {
            warn!(
                "Discarding {} bytes past the end of content store {:?}",
                physical - logical,
                path
            );
            file.set_len(logical).map_err(|e| StrataError::store_io("open", e))?;
        }

        debug!("Opened content store {:?} ({} records, {} bytes)", path, index.len(), logical);
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            engine: Mutex::new(CompressionEngine::new(compression_level, chunk_size)),
        })
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compression totals since the store was opened
    pub fn compression_stats(&self) -> CompressionStats {
        self.engine.lock().stats().clone()
    }

    /// Compress `declared_length` bytes from `reader` and register a record
    ///
    /// A zero-length call never touches the compressor and yields a record
    /// with both lengths zero.
    pub fn store<R: Read>(&self, index: &mut ContentIndex, reader: R, declared_length: u64) -> Result<ContentRecord> {
        if declared_length == 0 {
            let record = index.register(0, 0);
            trace!("Stored empty content record {}", record.content_id);
            return Ok(record);
        }

        let offset = index.end_offset();
        let written = {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StrataError::store_io("append", e))?;
            let (_, written) = self
                .engine
                .lock()
                .compress_stream(reader, declared_length, &mut *file)
                .map_err(|e| StrataError::store_io("append", e))?;
            written
        };

        let record = index.register(declared_length, written);
        trace!(
            "Stored content record {} at {} ({} -> {} bytes)",
            record.content_id,
            record.store_offset,
            declared_length,
            written
        );
        Ok(record)
    }

    /// Decompress record `content_id` into `sink`, returning the bytes written
    pub fn retrieve<W: Write>(&self, index: &ContentIndex, content_id: u64, sink: W) -> Result<u64> {
        let record = *index
            .get(content_id)
            .ok_or(StrataError::ContentNotFound(content_id))?;
        if record.uncompressed_length == 0 {
            return Ok(0);
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(record.store_offset))
            .map_err(|e| StrataError::store_io("retrieve", e))?;
        let written = self
            .engine
            .lock()
            .decompress_stream(&mut *file, record.compressed_length, sink)
            .map_err(|e| StrataError::store_io("retrieve", e))?;

        if written != record.uncompressed_length {
            return Err(StrataError::corruption(format!(
                "content record {} decompressed to {} bytes, expected {}",
                content_id, written, record.uncompressed_length
            )));
        }
        Ok(written)
    }

    /// Copy `length` raw bytes starting at `offset` into `writer`
    pub fn export_range<W: Write>(&self, offset: u64, length: u64, mut writer: W) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StrataError::store_io("export", e))?;
        let copied = std::io::copy(&mut (&mut *file).take(length), &mut writer)
            .map_err(|e| StrataError::store_io("export", e))?;
        if copied != length {
            return Err(StrataError::corruption(format!(
                "content store ended after {} of {} bytes at offset {}",
                copied, length, offset
            )));
        }
        Ok(())
    }

    /// Write `length` raw bytes from `reader` at `offset`
    ///
    /// The caller registers the matching records only after this returns.
    pub fn import_range<R: Read>(&self, offset: u64, reader: R, length: u64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StrataError::store_io("import", e))?;
        let copied = std::io::copy(&mut reader.take(length), &mut *file)
            .map_err(|e| StrataError::store_io("import", e))?;
        if copied != length {
            return Err(StrataError::corruption(format!(
                "patch file ended after {} of {} content bytes",
                copied, length
            )));
        }
        Ok(())
    }

    /// Flush written bytes to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| StrataError::store_io("sync", e))
    }
}
