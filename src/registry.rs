//! Mount and inode registry
//!
//! Every local filesystem gets a small engine-assigned id. For each id the
//! registry remembers which inodes already have stored content and which
//! tracked paths point at them, so a second hardlink to a known inode can
//! reuse the existing content record instead of storing the bytes again.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Mount points and the id allocator, persisted as one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTable {
    /// Mount point -> filesystem id
    pub mounts: BTreeMap<PathBuf, u64>,
    /// Id given to the next registered mount
    pub next_filesystem_id: u64,
}

impl Default for MountTable {
    fn default() -> Self {
        Self {
            mounts: BTreeMap::new(),
            next_filesystem_id: 1,
        }
    }
}

/// Canonical content and the tracked paths sharing one inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeEntry {
    /// Content record stored for the first path seen
    pub content_id: u64,
    /// Fully-qualified paths currently linked to the inode
    pub paths: BTreeSet<String>,
}

/// Registry of mounted filesystems and their linked inodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemRegistry {
    table: MountTable,
    inodes: BTreeMap<(u64, u64), InodeEntry>,
}

impl FilesystemRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from its persisted parts
    pub fn from_parts(table: MountTable, inodes: impl IntoIterator<Item = ((u64, u64), InodeEntry)>) -> Self {
        Self {
            table,
            inodes: inodes.into_iter().collect(),
        }
    }

    /// Mount table (for persistence and display)
    pub fn mount_table(&self) -> &MountTable {
        &self.table
    }

    /// Register `path` as a mount point, returning its id
    ///
    /// Registering an already-known mount point returns the existing id; ids
    /// are never reassigned.
    pub fn register_mount(&mut self, path: impl Into<PathBuf>) -> u64 {
        let path = path.into();
        if let Some(id) = self.table.mounts.get(&path) {
            return *id;
        }
        let id = self.table.next_filesystem_id;
        self.table.next_filesystem_id += 1;
        debug!("Registered mount {:?} as filesystem {}", path, id);
        self.table.mounts.insert(path, id);
        id
    }

    /// Register every local mount in `mount_table` that is not yet known
    ///
    /// Returns the ids handed out.
    pub fn check_filesystems(&mut self, mount_table: &[(PathBuf, bool)]) -> Vec<u64> {
        let unknown: Vec<PathBuf> = mount_table
            .iter()
            .filter(|(path, is_local)| *is_local && !self.table.mounts.contains_key(path))
            .map(|(path, _)| path.clone())
            .collect();
        unknown.into_iter().map(|path| self.register_mount(path)).collect()
    }

    /// Whether `filesystem_id` has been handed out
    pub fn is_registered(&self, filesystem_id: u64) -> bool {
        self.table.mounts.values().any(|id| *id == filesystem_id)
    }

    /// Filesystem id of the longest registered mount point containing `path`
    pub fn mount_for(&self, path: &Path) -> Option<u64> {
        self.table
            .mounts
            .iter()
            .filter(|(mount, _)| path.starts_with(mount))
            .max_by_key(|(mount, _)| mount.components().count())
            .map(|(_, id)| *id)
    }

    /// Record that `path` links to `inode`
    ///
    /// The first path seen for an inode makes `content_id` its canonical
    /// content; later paths are hardlinks and only join the path set.
    /// Returns `true` when the inode was new.
    pub fn link(&mut self, filesystem_id: u64, inode: u64, content_id: u64, path: &str) -> Result<bool> {
        if !self.is_registered(filesystem_id) {
            return Err(StrataError::internal(format!(
                "link of {} on unregistered filesystem {}",
                path, filesystem_id
            )));
        }
        let mut created = false;
        let entry = self.inodes.entry((filesystem_id, inode)).or_insert_with(|| {
            created = true;
            InodeEntry {
                content_id,
                paths: BTreeSet::new(),
            }
        });
        entry.paths.insert(path.to_string());
        trace!(
            "Linked {} to inode {}:{} ({} paths)",
            path,
            filesystem_id,
            inode,
            entry.paths.len()
        );
        Ok(created)
    }

    /// Remove `path` from the inode's path set
    ///
    /// Once no path is left the inode entry is purged, since the filesystem
    /// may recycle the inode number. Returns `true` when that happened.
    pub fn unlink(&mut self, filesystem_id: u64, inode: u64, path: &str) -> bool {
        let key = (filesystem_id, inode);
        let Some(entry) = self.inodes.get_mut(&key) else {
            trace!("Unlink of {} from unknown inode {}:{}", path, filesystem_id, inode);
            return false;
        };
        entry.paths.remove(path);
        if entry.paths.is_empty() {
            self.inodes.remove(&key);
            return true;
        }
        false
    }

    /// Canonical content id of an already-linked inode
    pub fn resolve(&self, filesystem_id: u64, inode: u64) -> Option<u64> {
        self.inodes.get(&(filesystem_id, inode)).map(|e| e.content_id)
    }

    /// Paths currently sharing an inode
    pub fn paths(&self, filesystem_id: u64, inode: u64) -> Vec<String> {
        self.inodes
            .get(&(filesystem_id, inode))
            .map(|e| e.paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Inode entry, if any
    pub fn entry(&self, filesystem_id: u64, inode: u64) -> Option<&InodeEntry> {
        self.inodes.get(&(filesystem_id, inode))
    }

    /// Number of linked inodes across all filesystems
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }
}
