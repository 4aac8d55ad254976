//! Live Updater: applies scan deltas straight to the live tree
//!
//! Each [`Delta`] call mutates the live tree (and the content store and inode
//! registry where needed) and commits the touched keys before returning, so
//! a crash loses at most the entry being processed.
//!
//! The staged variants (`add_content`, `remove_content`, ...) perform the same
//! mutation without committing; the patch recorder uses them to fold its own
//! bookkeeping into the same commit.

use crate::database::Database;
use crate::delta::Delta;
use crate::error::{Result, StrataError};
use crate::fs_source::FileSystem;
use crate::tree::{dir_fq_path, fq_path, Node, NodeType};
use crate::types::{FsEntry, ScanSummary};
use std::io;
use tracing::debug;

/// Delta consumer mutating the live tree
pub struct LiveUpdater<'a> {
    db: &'a mut Database,
    fs: &'a dyn FileSystem,
    stack: Vec<String>,
    depth: usize,
    summary: ScanSummary,
}

impl<'a> LiveUpdater<'a> {
    /// Updater writing into `db`, reading file content through `fs`
    pub fn new(db: &'a mut Database, fs: &'a dyn FileSystem) -> Self {
        Self {
            db,
            fs,
            stack: Vec::new(),
            depth: 0,
            summary: ScanSummary::default(),
        }
    }

    /// Counters collected so far
    pub fn summary(&self) -> &ScanSummary {
        &self.summary
    }

    /// Consume the updater, returning its counters
    pub fn into_summary(self) -> ScanSummary {
        self.summary
    }

    /// Component stack of the current directory
    pub fn components(&self) -> &[String] {
        &self.stack
    }

    /// Number of open `push_dir` calls
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn database(&mut self) -> &mut Database {
        &mut *self.db
    }

    pub(crate) fn summary_mut(&mut self) -> &mut ScanSummary {
        &mut self.summary
    }

    pub(crate) fn enter(&mut self, name: &str) -> Result<()> {
        if self.depth > 0 {
            self.stack.push(name.to_string());
        }
        self.depth += 1;
        let exists = self
            .db
            .root()
            .as_directory()
            .and_then(|d| d.get_dir(&self.stack))
            .is_some();
        if !exists {
            return Err(StrataError::internal(format!(
                "push into unknown live directory {:?}",
                dir_fq_path(&self.stack)
            )));
        }
        Ok(())
    }

    pub(crate) fn leave(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(StrataError::internal("pop_dir without matching push_dir"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            self.stack.pop();
        }
        Ok(())
    }

    /// Insert the node for `entry`, storing or resolving its content
    pub(crate) fn add_content(&mut self, entry: &FsEntry, force_placeholder: bool) -> Result<Node> {
        let fq = fq_path(&self.stack, &entry.name);
        let content_id = if entry.node_type == NodeType::RegularFile {
            let fs_id = entry
                .filesystem_id
                .ok_or_else(|| StrataError::UnknownFilesystem(entry.path.clone()))?;
            let existing = if entry.nlink > 1 {
                self.db.registry().resolve(fs_id, entry.inode)
            } else {
                None
            };
            let content_id = match existing {
                Some(id) => {
                    debug!(
                        "   HARDLINK to existing content {}: {:?}",
                        id,
                        self.db.registry().paths(fs_id, entry.inode)
                    );
                    self.summary.hardlinks_resolved += 1;
                    id
                }
                None if force_placeholder || entry.size == 0 => self.db.store_content(io::empty(), 0)?.content_id,
                None => {
                    let reader = self.fs.open(&entry.path)?;
                    let record = self.db.store_content(reader, entry.size)?;
                    self.summary.bytes_stored += entry.size;
                    record.content_id
                }
            };
            self.db.link_inode(fs_id, entry.inode, content_id, &fq)?;
            content_id
        } else {
            0
        };

        debug!(
            "Adding: {} {:<8} {}",
            if force_placeholder { "ZERO" } else { "NRML" },
            entry.node_type.label(),
            fq
        );
        let node = entry.to_node(content_id);
        self.db.insert_entry(&self.stack, node.clone())?;
        self.summary.entries_added += 1;
        Ok(node)
    }

    pub(crate) fn remove_content(&mut self, node: &Node) -> Result<()> {
        let fq = fq_path(&self.stack, &node.name);
        debug!("Removing: {:<8} {}", node.node_type().label(), fq);
        if let Some(file) = node.as_regular_file() {
            let paths = self.db.registry().paths(file.filesystem_id, file.inode);
            if paths.len() > 1 {
                debug!("   Removing HARDLINK to existing content: {:?}", paths);
            }
            self.db.unlink_inode(file.filesystem_id, file.inode, &fq);
        }
        self.db.remove_entry(&self.stack, &node.name)?;
        self.summary.entries_removed += 1;
        Ok(())
    }

    pub(crate) fn change_metadata(&mut self, node: &Node, entry: &FsEntry) -> Result<()> {
        debug!(
            "MetaChange: {} {} ==> {}",
            fq_path(&self.stack, &node.name),
            node.owner,
            entry.owner
        );
        self.db.set_ownership(&self.stack, &node.name, entry.owner)?;
        self.summary.metadata_changed += 1;
        Ok(())
    }

    pub(crate) fn remove_directory(&mut self, node: &Node) -> Result<()> {
        debug!("Removing Dir: {}", fq_path(&self.stack, &node.name));
        self.db.remove_entry(&self.stack, &node.name)?;
        self.summary.dirs_removed += 1;
        Ok(())
    }

    pub(crate) fn add_directory(&mut self, entry: &FsEntry) -> Result<Node> {
        debug!("Adding Dir: {}", fq_path(&self.stack, &entry.name));
        let node = Node::directory(entry.name.clone(), entry.owner, entry.mtime_nanos);
        self.db.insert_entry(&self.stack, node.clone())?;
        self.summary.dirs_added += 1;
        Ok(node)
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.db.commit()
    }
}

impl Delta for LiveUpdater<'_> {
    fn live_root(&self) -> &Node {
        self.db.root()
    }

    fn push_dir(&mut self, name: &str) -> Result<()> {
        self.enter(name)
    }

    fn pop_dir(&mut self) -> Result<()> {
        self.leave()
    }

    fn content_added(&mut self, entry: &FsEntry, force_placeholder: bool) -> Result<()> {
        self.add_content(entry, force_placeholder)?;
        self.commit()
    }

    fn content_removed(&mut self, node: &Node) -> Result<()> {
        self.remove_content(node)?;
        self.commit()
    }

    fn metadata_changed(&mut self, node: &Node, entry: &FsEntry) -> Result<()> {
        self.change_metadata(node, entry)?;
        self.commit()
    }

    fn directory_removed(&mut self, node: &Node) -> Result<()> {
        self.remove_directory(node)?;
        self.commit()
    }

    fn directory_added(&mut self, entry: &FsEntry) -> Result<()> {
        self.add_directory(entry)?;
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use crate::tree::Ownership;
    use std::path::Path;
    use tempfile::TempDir;

    fn entry(dir: &Path, name: &str, inode: u64, nlink: u64, data: &[u8]) -> FsEntry {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        FsEntry {
            name: name.to_string(),
            path,
            node_type: NodeType::RegularFile,
            owner: Ownership::new(0, 0, 0o644),
            mtime_nanos: 1,
            inode,
            nlink,
            size: data.len() as u64,
            device: None,
            symlink_target: None,
            filesystem_id: Some(1),
        }
    }

    fn database(dir: &TempDir) -> Database {
        let mut db = Database::load(
            Box::new(MemoryObjectStore::new()),
            &dir.path().join("content.store"),
            6,
            1024,
        )
        .unwrap();
        db.register_mount(Path::new("/"));
        db
    }

    #[test]
    fn test_hardlinks_share_content() {
        let dir = TempDir::new().unwrap();
        let mut db = database(&dir);
        let fs = crate::fs_source::LocalFileSystem::default();
        let b1 = entry(dir.path(), "b1", 50, 2, b"shared");
        let b2 = entry(dir.path(), "b2", 50, 2, b"shared");

        let mut updater = LiveUpdater::new(&mut db, &fs);
        updater.push_dir("").unwrap();
        updater.content_added(&b1, false).unwrap();
        updater.content_added(&b2, false).unwrap();
        updater.pop_dir().unwrap();
        let summary = updater.into_summary();
        assert_eq!(summary.hardlinks_resolved, 1);
        assert_eq!(summary.bytes_stored, 6);

        assert_eq!(db.index().len(), 1);
        let root = db.root().as_directory().unwrap();
        let id1 = root.get("b1").unwrap().as_regular_file().unwrap().content_id;
        let id2 = root.get("b2").unwrap().as_regular_file().unwrap().content_id;
        assert_eq!(id1, id2);
        assert_eq!(db.registry().paths(1, 50), vec!["/b1".to_string(), "/b2".to_string()]);
    }

    #[test]
    fn test_placeholder_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let mut db = database(&dir);
        let fs = crate::fs_source::LocalFileSystem::default();
        let big = entry(dir.path(), "big", 7, 1, &[7u8; 4096]);

        let mut updater = LiveUpdater::new(&mut db, &fs);
        updater.push_dir("").unwrap();
        updater.content_added(&big, true).unwrap();
        updater.pop_dir().unwrap();

        let record = db.index().get(1).unwrap();
        assert_eq!(record.uncompressed_length, 0);
        assert_eq!(record.compressed_length, 0);
        assert_eq!(db.index().end_offset(), 0);
    }

    #[test]
    fn test_remove_unlinks_inode() {
        let dir = TempDir::new().unwrap();
        let mut db = database(&dir);
        let fs = crate::fs_source::LocalFileSystem::default();
        let a = entry(dir.path(), "a", 3, 1, b"abc");

        let mut updater = LiveUpdater::new(&mut db, &fs);
        updater.push_dir("").unwrap();
        let node = updater.add_content(&a, false).unwrap();
        updater.commit().unwrap();
        updater.content_removed(&node).unwrap();
        updater.pop_dir().unwrap();

        assert!(db.root().as_directory().unwrap().get("a").is_none());
        assert_eq!(db.registry().resolve(1, 3), None);
    }

    #[test]
    fn test_push_into_unknown_directory_fails() {
        let dir = TempDir::new().unwrap();
        let mut db = database(&dir);
        let fs = crate::fs_source::LocalFileSystem::default();
        let mut updater = LiveUpdater::new(&mut db, &fs);
        updater.push_dir("").unwrap();
        assert!(updater.push_dir("nope").is_err());
    }
}
