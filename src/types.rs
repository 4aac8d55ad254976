//! Core data types used throughout the Strata library
//!
//! This module contains the data structures shared between components that
//! are not part of the tree model itself:
//! - **Filesystem observations**: [`FsEntry`], what the enumeration layer reports
//! - **Content index**: [`ContentRecord`], one stored byte range
//! - **Configuration**: [`StrataConfig`], persisted next to the store
//! - **Operation results**: [`ScanSummary`], [`ApplySummary`]

use crate::tree::{DeviceNumber, Node, NodeKind, NodeType, Ownership, RegularFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default chunk size for streaming content through the compressor
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default zlib compression level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// One directory entry as observed on the live filesystem (`lstat` view)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Entry name within its directory
    pub name: String,
    /// Absolute path on the live filesystem
    pub path: PathBuf,
    /// File type
    pub node_type: NodeType,
    /// Owner and permission bits (type bits already stripped)
    pub owner: Ownership,
    /// Modification time in nanoseconds since the epoch
    pub mtime_nanos: i64,
    /// Inode number
    pub inode: u64,
    /// Hard link count
    pub nlink: u64,
    /// Size in bytes
    pub size: u64,
    /// Device numbers for block/char devices
    pub device: Option<DeviceNumber>,
    /// Link target for symlinks
    pub symlink_target: Option<String>,
    /// Filesystem id, attached by the scanner to regular files it reports
    pub filesystem_id: Option<u64>,
}

impl FsEntry {
    /// Build the live-tree node for this entry
    ///
    /// `content_id` is only used for regular files. Directories are created
    /// empty; their children are reported separately.
    pub fn to_node(&self, content_id: u64) -> Node {
        let kind = match self.node_type {
            NodeType::Directory => NodeKind::Directory(Default::default()),
            NodeType::RegularFile => NodeKind::RegularFile(RegularFile {
                inode: self.inode,
                size: self.size,
                filesystem_id: self.filesystem_id.unwrap_or_default(),
                content_id,
            }),
            NodeType::Symlink => NodeKind::Symlink {
                target: self.symlink_target.clone().unwrap_or_default(),
            },
            NodeType::Socket => NodeKind::Socket,
            NodeType::Fifo => NodeKind::Fifo,
            NodeType::BlockDevice => NodeKind::BlockDevice(self.device.unwrap_or(DeviceNumber { major: 0, minor: 0 })),
            NodeType::CharDevice => NodeKind::CharDevice(self.device.unwrap_or(DeviceNumber { major: 0, minor: 0 })),
        };
        Node {
            name: self.name.clone(),
            owner: self.owner,
            mtime_nanos: self.mtime_nanos,
            kind,
        }
    }

    /// Whether the content of this entry differs from the recorded `node`
    ///
    /// Only symlink targets and regular-file mtimes count as content; every
    /// other type has no content of its own.
    pub fn content_differs(&self, node: &Node) -> bool {
        match (&node.kind, self.node_type) {
            (NodeKind::Symlink { target }, NodeType::Symlink) => {
                self.symlink_target.as_deref() != Some(target.as_str())
            }
            (NodeKind::RegularFile(_), NodeType::RegularFile) => self.mtime_nanos != node.mtime_nanos,
            _ => false,
        }
    }
}

/// Index entry describing one stored byte range of the content store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Sequential id, starting at 1, never reused
    pub content_id: u64,
    /// Offset of the compressed bytes in the store file
    pub store_offset: u64,
    /// Length of the original content
    pub uncompressed_length: u64,
    /// Length of the compressed bytes in the store file
    pub compressed_length: u64,
}

impl ContentRecord {
    /// Offset just past this record's bytes
    pub fn end_offset(&self) -> u64 {
        self.store_offset + self.compressed_length
    }
}

/// Configuration for a Strata instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Root directory being tracked
    pub root_path: PathBuf,
    /// Storage location
    pub storage_path: PathBuf,
    /// zlib compression level (0-9)
    pub compression_level: u32,
    /// Chunk size used when streaming content in and out of the store
    pub chunk_size: usize,
    /// Skip mount points whose filesystem type is not local
    pub ignore_non_local_mounts: bool,
    /// Filesystem types considered local when reading the mount table
    pub local_filesystem_types: Vec<String>,
    /// Absolute paths excluded from scanning
    pub ignore_paths: Vec<PathBuf>,
    /// Tracked paths whose new files are stored as zero-length placeholders
    pub touch_new_paths: Vec<String>,
    /// Tracked paths where only directories are tracked
    pub track_dirs_only_paths: Vec<String>,
    /// Strata version that created this config
    pub version: String,
}

impl StrataConfig {
    /// Default configuration for tracking `root_path` into `storage_path`
    pub fn new(root_path: PathBuf, storage_path: PathBuf) -> Self {
        Self {
            root_path,
            storage_path,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ignore_non_local_mounts: true,
            local_filesystem_types: default_local_filesystem_types(),
            ignore_paths: Vec::new(),
            touch_new_paths: Vec::new(),
            track_dirs_only_paths: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Filesystem types treated as local by default
pub fn default_local_filesystem_types() -> Vec<String> {
    ["ext2", "ext3", "ext4", "btrfs", "xfs"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Counters collected while a scan round mutates the live tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Non-directory entries added
    pub entries_added: usize,
    /// Non-directory entries removed
    pub entries_removed: usize,
    /// Directories added
    pub dirs_added: usize,
    /// Directories removed
    pub dirs_removed: usize,
    /// Metadata-only changes
    pub metadata_changed: usize,
    /// New hardlinks resolved to existing content
    pub hardlinks_resolved: usize,
    /// Uncompressed bytes written to the content store
    pub bytes_stored: u64,
    /// Sequence number of the patch completed by this scan, if any
    pub completed_patch: Option<u64>,
    /// Directories listed on the live filesystem
    pub dirs_scanned: usize,
    /// Subtrees skipped because their directory could not be listed
    pub subtrees_skipped: usize,
    /// Wall-clock duration of the scan in milliseconds
    pub duration_ms: u64,
}

impl ScanSummary {
    /// Whether the scan observed any change
    pub fn has_changes(&self) -> bool {
        self.entries_added + self.entries_removed + self.dirs_added + self.dirs_removed + self.metadata_changed > 0
    }
}

/// Result of applying (or reverting) a patch onto a target tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplySummary {
    /// Sequence number of the patch
    pub sequence_number: u64,
    /// Whether the patch was applied forward
    pub forward: bool,
    /// Non-directory entries created
    pub entries_created: usize,
    /// Non-directory entries unlinked
    pub entries_removed: usize,
    /// Directories created
    pub dirs_created: usize,
    /// Directories removed
    pub dirs_removed: usize,
    /// Ownership/mode changes applied
    pub metadata_applied: usize,
    /// Bytes written for regular files
    pub bytes_written: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Non-fatal issues (e.g. ownership could not be restored)
    pub warnings: Vec<String>,
}
