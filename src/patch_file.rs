//! Portable patch files
//!
//! A patch file carries one completed patch together with the content-store
//! bytes it introduced, so that another instance holding the same chain up to
//! the patch's predecessor can append it.
//!
//! ## Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! 16 bytes   patch uuid
//! 16 bytes   previous patch uuid
//!  8 bytes   L, length of the exported content-store range
//!  8 bytes   S, length of the content index block
//!  S bytes   content index block (bincode list of ContentRecord)
//!  L bytes   raw content-store bytes
//! then until EOF, one per patched directory, parents first:
//!  4 bytes   D, descriptor length
//!  D bytes   descriptor (bincode DirDescriptor)
//! ```

use crate::chain::{DirState, MetaChange, Patch, PatchTreeNode};
use crate::database::Database;
use crate::error::{Result, StrataError};
use crate::object_store::{decode, encode};
use crate::tree::{dir_fq_path, split_fq, Node, Ownership};
use crate::types::ContentRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Size of the fixed header
pub const HEADER_LEN: u64 = 48;

/// One patched directory as written to a patch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DirDescriptor {
    fq_path: String,
    name: String,
    owner: Ownership,
    mtime_nanos: i64,
    state: DirState,
    adds: Vec<Node>,
    removes: Vec<Node>,
    meta_changes: BTreeMap<String, MetaChange>,
}

impl DirDescriptor {
    fn from_node(stack: &[String], node: &PatchTreeNode) -> Self {
        Self {
            fq_path: dir_fq_path(stack),
            name: node.name.clone(),
            owner: node.owner,
            mtime_nanos: node.mtime_nanos,
            state: node.state,
            adds: node.adds.values().cloned().collect(),
            removes: node.removes.values().cloned().collect(),
            meta_changes: node.meta_changes.clone(),
        }
    }

    fn into_node(self) -> PatchTreeNode {
        let mut node = PatchTreeNode::new(self.name, self.owner, self.mtime_nanos, self.state);
        node.adds = self.adds.into_iter().map(|n| (n.name.clone(), n)).collect();
        node.removes = self.removes.into_iter().map(|n| (n.name.clone(), n)).collect();
        node.meta_changes = self.meta_changes;
        node
    }
}

/// Fixed-size header of a patch file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchFileHeader {
    /// Uuid of the carried patch
    pub uuid: Uuid,
    /// Uuid of the patch it follows
    pub previous_uuid: Uuid,
    /// Length of the raw content range (L)
    pub content_length: u64,
    /// Length of the content index block (S)
    pub index_length: u64,
}

impl PatchFileHeader {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.uuid.as_bytes())?;
        w.write_all(self.previous_uuid.as_bytes())?;
        w.write_all(&self.content_length.to_be_bytes())?;
        w.write_all(&self.index_length.to_be_bytes())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN as usize];
        read_exact_or_corrupt(r, &mut buf, "header")?;
        let mut uuid = [0u8; 16];
        let mut previous = [0u8; 16];
        let mut l = [0u8; 8];
        let mut s = [0u8; 8];
        uuid.copy_from_slice(&buf[0..16]);
        previous.copy_from_slice(&buf[16..32]);
        l.copy_from_slice(&buf[32..40]);
        s.copy_from_slice(&buf[40..48]);
        Ok(Self {
            uuid: Uuid::from_bytes(uuid),
            previous_uuid: Uuid::from_bytes(previous),
            content_length: u64::from_be_bytes(l),
            index_length: u64::from_be_bytes(s),
        })
    }
}

/// What an export or import moved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFileInfo {
    /// Patch header fields
    pub header: PatchFileHeader,
    /// Local sequence number of the patch
    pub sequence_number: u64,
    /// Content records carried
    pub record_count: usize,
    /// Patched directories carried
    pub dir_count: usize,
}

fn read_exact_or_corrupt<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => StrataError::corruption(format!("patch file truncated in {}", what)),
        _ => StrataError::Io(e),
    })
}

/// Write completed patch `sequence_number` to `dest`
///
/// The file is written next to `dest` and renamed into place, so a failed
/// export never leaves a partial file behind.
#[instrument(skip(db))]
pub fn export_patch(db: &Database, sequence_number: u64, dest: &Path) -> Result<PatchFileInfo> {
    let patch = db
        .chain()
        .get(sequence_number)
        .ok_or(StrataError::PatchNotFound(sequence_number))?;
    if !patch.is_complete {
        return Err(StrataError::IncompletePatch(sequence_number));
    }

    let records: Vec<ContentRecord> = db
        .index()
        .range(patch.starting_content_id, patch.ending_content_id)
        .copied()
        .collect();
    if records.len() as u64 != patch.content_count() {
        return Err(StrataError::corruption(format!(
            "patch {} names content {}..={} but only {} records exist",
            sequence_number,
            patch.starting_content_id,
            patch.ending_content_id,
            records.len()
        )));
    }
    let (offset, content_length) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first.store_offset, last.end_offset() - first.store_offset),
        _ => (0, 0),
    };
    let index_block = encode(&records)?;

    let mut descriptors = Vec::new();
    patch.root.walk(&mut |stack, node| {
        descriptors.push(DirDescriptor::from_node(stack, node));
    });

    let header = PatchFileHeader {
        uuid: patch.uuid,
        previous_uuid: patch.previous_uuid,
        content_length,
        index_length: index_block.len() as u64,
    };

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        header.write_to(&mut w)?;
        w.write_all(&index_block)?;
        db.content().export_range(offset, content_length, &mut w)?;
        for descriptor in &descriptors {
            let bytes = encode(descriptor)?;
            let len = u32::try_from(bytes.len()).map_err(|_| {
                StrataError::internal(format!("descriptor for {:?} too large", descriptor.fq_path))
            })?;
            w.write_all(&len.to_be_bytes())?;
            w.write_all(&bytes)?;
        }
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StrataError::Io(e.error))?;

    info!(
        "Exported patch {} ({}) to {:?}: {} records, {} content bytes, {} directories",
        sequence_number,
        patch.uuid,
        dest,
        records.len(),
        content_length,
        descriptors.len()
    );
    Ok(PatchFileInfo {
        header,
        sequence_number,
        record_count: records.len(),
        dir_count: descriptors.len(),
    })
}

/// Read only the fixed header of a patch file
pub fn read_header(path: &Path) -> Result<PatchFileHeader> {
    let mut file = File::open(path)?;
    PatchFileHeader::read_from(&mut file)
}

/// Check ids and offsets of imported records against the local index
fn check_records(records: &[ContentRecord], next_content_id: u64, content_length: u64) -> Result<()> {
    let mut expected_offset = records.first().map_or(0, |r| r.store_offset);
    for (i, record) in records.iter().enumerate() {
        let expected_id = next_content_id + i as u64;
        if record.content_id != expected_id {
            return Err(StrataError::chain(format!(
                "imported content id {} where {} was expected",
                record.content_id, expected_id
            )));
        }
        if record.store_offset != expected_offset {
            return Err(StrataError::corruption(format!(
                "imported content record {} at offset {}, expected {}",
                record.content_id, record.store_offset, expected_offset
            )));
        }
        expected_offset = record
            .store_offset
            .checked_add(record.compressed_length)
            .ok_or_else(|| StrataError::corruption(format!("content record {} overflows the store", record.content_id)))?;
    }
    let total = records
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add(r.compressed_length))
        .ok_or_else(|| StrataError::corruption("content index lengths overflow"))?;
    if total != content_length {
        return Err(StrataError::corruption(format!(
            "content index covers {} bytes but the file carries {}",
            total, content_length
        )));
    }
    Ok(())
}

/// Insert a parsed descriptor, creating missing ancestors
fn place(root: &mut PatchTreeNode, descriptor: DirDescriptor) -> Result<()> {
    let components = split_fq(&descriptor.fq_path);
    let Some((name, parents)) = components.split_last() else {
        let subdirs = std::mem::take(&mut root.subdirs);
        *root = descriptor.into_node();
        root.subdirs = subdirs;
        return Ok(());
    };
    let mut node = root;
    for part in parents {
        node = node
            .subdirs
            .entry(part.clone())
            .or_insert_with(|| PatchTreeNode::new(part.clone(), Ownership::default(), 0, DirState::Existing));
    }
    if name != &descriptor.name {
        return Err(StrataError::corruption(format!(
            "descriptor {:?} names directory {:?}",
            descriptor.fq_path, descriptor.name
        )));
    }
    let existing = node.subdirs.remove(name);
    let mut placed = descriptor.into_node();
    if let Some(existing) = existing {
        placed.subdirs = existing.subdirs;
    }
    node.subdirs.insert(name.clone(), placed);
    Ok(())
}

/// Append the patch carried by the file at `src` to the local chain
///
/// Everything is validated before the local state changes: the patch must
/// follow the chain head, no patch may be open, and the carried records must
/// continue the local content id sequence.
#[instrument(skip(db))]
pub fn import_patch(db: &mut Database, src: &Path) -> Result<PatchFileInfo> {
    let file = File::open(src)?;
    let file_len = file.metadata()?.len();
    let mut r = BufReader::new(file);

    let header = PatchFileHeader::read_from(&mut r)?;
    db.chain().check_importable(header.previous_uuid)?;

    let content_start = HEADER_LEN
        .checked_add(header.index_length)
        .filter(|start| *start <= file_len)
        .ok_or_else(|| StrataError::corruption("content index block runs past end of file"))?;
    let descriptors_start = content_start
        .checked_add(header.content_length)
        .filter(|start| *start <= file_len)
        .ok_or_else(|| StrataError::corruption("content bytes run past end of file"))?;

    let mut index_block = vec![0u8; header.index_length as usize];
    read_exact_or_corrupt(&mut r, &mut index_block, "content index")?;
    let records: Vec<ContentRecord> = decode(&index_block)?;
    let next_content_id = db.index().next_content_id();
    check_records(&records, next_content_id, header.content_length)?;

    r.seek(SeekFrom::Start(descriptors_start))?;
    let mut root = PatchTreeNode::root();
    let mut dir_count = 0;
    loop {
        let pos = r.stream_position()?;
        if pos >= file_len {
            break;
        }
        let mut len = [0u8; 4];
        read_exact_or_corrupt(&mut r, &mut len, "descriptor length")?;
        let len = u32::from_be_bytes(len) as u64;
        if pos + 4 + len > file_len {
            return Err(StrataError::corruption(format!("descriptor at {} runs past end of file", pos)));
        }
        let mut bytes = vec![0u8; len as usize];
        read_exact_or_corrupt(&mut r, &mut bytes, "descriptor")?;
        let descriptor: DirDescriptor = decode(&bytes)?;
        debug!("Imported directory {:?} {}", descriptor.fq_path, descriptor.state.label());
        place(&mut root, descriptor)?;
        dir_count += 1;
    }

    let local_end = db.index().end_offset();
    let first_offset = records.first().map_or(0, |r| r.store_offset);
    r.seek(SeekFrom::Start(content_start))?;
    db.content().import_range(local_end, &mut r, header.content_length)?;
    let rebased: Vec<ContentRecord> = records
        .iter()
        .map(|record| ContentRecord {
            store_offset: local_end + (record.store_offset - first_offset),
            ..*record
        })
        .collect();

    let record_count = rebased.len();
    let patch = Patch::imported(
        header.uuid,
        header.previous_uuid,
        next_content_id,
        record_count as u64,
        root,
    );
    let sequence_number = db.append_imported(rebased, patch)?;
    db.commit()?;

    info!(
        "Imported patch {} from {:?} as {}: {} records, {} directories",
        header.uuid, src, sequence_number, record_count, dir_count
    );
    Ok(PatchFileInfo {
        header,
        sequence_number,
        record_count,
        dir_count,
    })
}
