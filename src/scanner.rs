//! Scanner: diffs the live tree against the filesystem
//!
//! For every directory the scanner classifies the children of the live node
//! and of the filesystem listing, keyed by (name, type), into removed, added
//! and unchanged entries in a single pass. Unchanged regular files whose
//! mtime moved and symlinks whose target moved are demoted to a remove/add
//! pair when content is tracked. The result is reported to a [`Delta`] in
//! the order documented on that trait.
//!
//! A directory that cannot be listed is reported with a warning and its
//! subtree is skipped; any other enumeration failure aborts the scan.

use crate::delta::Delta;
use crate::error::{Result, StrataError};
use crate::filter::Filter;
use crate::fs_source::FileSystem;
use crate::registry::MountTable;
use crate::tree::{dir_fq_path, Node, NodeType};
use crate::types::FsEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Outcome of classifying one directory
#[derive(Debug, Default)]
struct Classified {
    removed: Vec<Node>,
    added: Vec<FsEntry>,
    same: Vec<(Node, FsEntry)>,
}

fn classify(live: Vec<Node>, listing: Vec<FsEntry>, track_content: bool) -> Classified {
    let mut on_disk: BTreeMap<String, FsEntry> = listing.into_iter().map(|e| (e.name.clone(), e)).collect();
    let mut out = Classified::default();
    for node in live {
        match on_disk.remove(&node.name) {
            Some(entry) if entry.node_type == node.node_type() => {
                if track_content && entry.content_differs(&node) {
                    out.removed.push(node);
                    out.added.push(entry);
                } else {
                    out.same.push((node, entry));
                }
            }
            Some(entry) => {
                out.removed.push(node);
                out.added.push(entry);
            }
            None => out.removed.push(node),
        }
    }
    out.added.extend(on_disk.into_values());
    out.added.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Shallow copies of the live children of the directory at `stack`
fn live_children<D: Delta + ?Sized>(delta: &D, stack: &[String]) -> Result<Vec<Node>> {
    delta
        .live_root()
        .as_directory()
        .and_then(|d| d.get_dir(stack))
        .map(|d| d.children.values().map(Node::shallow_clone).collect())
        .ok_or_else(|| StrataError::internal(format!("live directory {:?} missing", dir_fq_path(stack))))
}

/// Tree differ driving a [`Delta`]
pub struct Scanner<'a> {
    fs: &'a dyn FileSystem,
    filter: Filter,
    mounts: Vec<(PathBuf, u64)>,
    stack: Vec<String>,
    dirs_scanned: usize,
    subtrees_skipped: usize,
}

impl<'a> Scanner<'a> {
    /// Scanner reading through `fs`, resolving filesystem ids from `mounts`
    pub fn new(fs: &'a dyn FileSystem, filter: Filter, mounts: &MountTable) -> Self {
        Self {
            fs,
            filter,
            mounts: mounts.mounts.iter().map(|(p, id)| (p.clone(), *id)).collect(),
            stack: Vec::new(),
            dirs_scanned: 0,
            subtrees_skipped: 0,
        }
    }

    /// Directories listed so far
    pub fn dirs_scanned(&self) -> usize {
        self.dirs_scanned
    }

    /// Subtrees skipped because they could not be listed
    pub fn subtrees_skipped(&self) -> usize {
        self.subtrees_skipped
    }

    /// Diff the filesystem tree at `root` against the consumer's live tree
    #[instrument(skip(self, delta))]
    pub fn scan<D: Delta + ?Sized>(&mut self, root: &Path, delta: &mut D) -> Result<()> {
        self.stack.clear();
        self.filter.push("");
        delta.push_dir("")?;
        self.diff_dir(root, delta)?;
        delta.pop_dir()?;
        self.filter.pop();
        debug!(
            "Scan of {:?} done: {} directories, {} skipped",
            root, self.dirs_scanned, self.subtrees_skipped
        );
        Ok(())
    }

    /// Filesystem id of the longest registered mount point containing `path`
    pub fn filesystem_id(&self, path: &Path) -> Result<u64> {
        self.mounts
            .iter()
            .filter(|(mount, _)| path.starts_with(mount))
            .max_by_key(|(mount, _)| mount.components().count())
            .map(|(_, id)| *id)
            .ok_or_else(|| StrataError::UnknownFilesystem(path.to_path_buf()))
    }

    fn list(&mut self, path: &Path) -> Result<Option<Vec<FsEntry>>> {
        match self.fs.read_dir(path) {
            Ok(listing) => {
                self.dirs_scanned += 1;
                Ok(Some(listing))
            }
            Err(StrataError::Io(e)) => {
                warn!("Skipping unreadable directory {:?}: {}", path, e);
                self.subtrees_skipped += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn enter<D: Delta + ?Sized>(&mut self, name: &str, delta: &mut D) -> Result<()> {
        delta.push_dir(name)?;
        self.filter.push(name);
        self.stack.push(name.to_string());
        Ok(())
    }

    fn leave<D: Delta + ?Sized>(&mut self, delta: &mut D) -> Result<()> {
        self.stack.pop();
        self.filter.pop();
        delta.pop_dir()
    }

    fn report_added<D: Delta + ?Sized>(&mut self, entry: &FsEntry, delta: &mut D) -> Result<()> {
        if entry.node_type == NodeType::RegularFile {
            let mut entry = entry.clone();
            entry.filesystem_id = Some(self.filesystem_id(&entry.path)?);
            delta.content_added(&entry, self.filter.touch_new_only())
        } else {
            delta.content_added(entry, self.filter.touch_new_only())
        }
    }

    fn diff_dir<D: Delta + ?Sized>(&mut self, path: &Path, delta: &mut D) -> Result<()> {
        let listing = match self.list(path)? {
            Some(listing) => listing,
            None => return Ok(()),
        };
        let live = live_children(delta, &self.stack)?;
        let track = self.filter.track_content();
        let Classified { removed, added, same } = classify(live, listing, track);

        if track {
            for node in removed.iter().filter(|n| !n.is_dir()) {
                delta.content_removed(node)?;
            }
        }
        for node in removed.iter().filter(|n| n.is_dir()) {
            self.remove_dir(node, delta)?;
        }
        if track {
            for entry in added.iter().filter(|e| e.node_type != NodeType::Directory) {
                if self.filter.is_ignored(&entry.path) {
                    continue;
                }
                self.report_added(entry, delta)?;
            }
        }
        for entry in added.iter().filter(|e| e.node_type == NodeType::Directory) {
            if self.filter.is_ignored(&entry.path) {
                debug!("Ignoring {:?}", entry.path);
                continue;
            }
            self.add_dir(entry, delta)?;
        }
        for (node, entry) in &same {
            if node.owner != entry.owner && (track || node.is_dir()) {
                delta.metadata_changed(node, entry)?;
            }
        }
        for (node, entry) in same.iter().filter(|(n, _)| n.is_dir()) {
            if self.filter.is_ignored(&entry.path) {
                continue;
            }
            self.enter(&node.name, delta)?;
            self.diff_dir(&entry.path, delta)?;
            self.leave(delta)?;
        }
        Ok(())
    }

    /// Report a vanished directory bottom-up
    fn remove_dir<D: Delta + ?Sized>(&mut self, node: &Node, delta: &mut D) -> Result<()> {
        self.enter(&node.name, delta)?;
        let children = live_children(delta, &self.stack)?;
        for child in children.iter().filter(|c| !c.is_dir()) {
            delta.content_removed(child)?;
        }
        for child in children.iter().filter(|c| c.is_dir()) {
            self.remove_dir(child, delta)?;
        }
        self.leave(delta)?;
        delta.directory_removed(node)
    }

    /// Report a new directory top-down
    fn add_dir<D: Delta + ?Sized>(&mut self, entry: &FsEntry, delta: &mut D) -> Result<()> {
        delta.directory_added(entry)?;
        self.enter(&entry.name, delta)?;
        if let Some(mut listing) = self.list(&entry.path)? {
            listing.sort_by(|a, b| a.name.cmp(&b.name));
            if self.filter.track_content() {
                for child in listing.iter().filter(|c| c.node_type != NodeType::Directory) {
                    if !self.filter.is_ignored(&child.path) {
                        self.report_added(child, delta)?;
                    }
                }
            }
            for child in listing.iter().filter(|c| c.node_type == NodeType::Directory) {
                if !self.filter.is_ignored(&child.path) {
                    self.add_dir(child, delta)?;
                }
            }
        }
        self.leave(delta)
    }
}
