//! Patch Applier: materializes a patch onto a target tree
//!
//! Applying forward replays the patch; applying in reverse swaps adds with
//! removes and added directories with removed ones, and restores the "from"
//! side of every metadata change. Per directory the order is:
//!
//! 1. unlink removed entries
//! 2. removed directories, bottom-up
//! 3. create added entries
//! 4. added directories, top-down, attributes set after their content
//! 5. metadata changes
//! 6. untouched subdirectories that carry changes further down
//!
//! There is no rollback. A failure leaves the target partially patched and
//! is reported as a reconstruction error naming the offending path.

use crate::chain::{DirState, PatchTreeNode};
use crate::database::Database;
use crate::error::{Result, StrataError};
use crate::tree::{Node, NodeKind, Ownership};
use crate::types::ApplySummary;
use crate::utils::{self, DeviceKind};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Mode of directories while they are being populated
const STAGING_DIR_MODE: u32 = 0o700;

/// Replays patches from a database onto a directory
pub struct PatchApplier<'a> {
    db: &'a Database,
    forward: bool,
    summary: ApplySummary,
}

impl<'a> PatchApplier<'a> {
    /// Applier reading patches and content from `db`
    pub fn new(db: &'a Database, forward: bool) -> Self {
        Self {
            db,
            forward,
            summary: ApplySummary {
                forward,
                ..Default::default()
            },
        }
    }

    /// Apply completed patch `sequence_number` under `target_root`
    #[instrument(skip(self))]
    pub fn apply(mut self, sequence_number: u64, target_root: &Path) -> Result<ApplySummary> {
        let start = Instant::now();
        let patch = self
            .db
            .chain()
            .get(sequence_number)
            .ok_or(StrataError::PatchNotFound(sequence_number))?;
        if !patch.is_complete {
            return Err(StrataError::IncompletePatch(sequence_number));
        }
        if !target_root.exists() {
            fs::create_dir_all(target_root).map_err(|e| StrataError::reconstruction(target_root, e))?;
        }

        self.summary.sequence_number = sequence_number;
        self.apply_dir(&patch.root, target_root)?;
        self.summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{} patch {} onto {:?}: {} created, {} removed, {} dirs created, {} dirs removed, {} metadata",
            if self.forward { "Applied" } else { "Reverted" },
            sequence_number,
            target_root,
            self.summary.entries_created,
            self.summary.entries_removed,
            self.summary.dirs_created,
            self.summary.dirs_removed,
            self.summary.metadata_applied
        );
        Ok(self.summary)
    }

    fn state(&self, node: &PatchTreeNode) -> DirState {
        if self.forward {
            node.state
        } else {
            node.state.reversed()
        }
    }

    fn apply_dir(&mut self, node: &PatchTreeNode, dir: &Path) -> Result<()> {
        let (adds, removes) = if self.forward {
            (&node.adds, &node.removes)
        } else {
            (&node.removes, &node.adds)
        };

        for entry in removes.values() {
            let path = dir.join(&entry.name);
            debug!("Unlink {:?}", path);
            fs::remove_file(&path).map_err(|e| StrataError::reconstruction(&path, e))?;
            self.summary.entries_removed += 1;
        }

        let removed: Vec<&PatchTreeNode> =
            node.subdirs.values().filter(|s| self.state(s) == DirState::Removed).collect();
        for sub in removed {
            let path = dir.join(&sub.name);
            self.apply_dir(sub, &path)?;
            debug!("Rmdir {:?}", path);
            fs::remove_dir(&path).map_err(|e| StrataError::reconstruction(&path, e))?;
            self.summary.dirs_removed += 1;
        }

        for entry in adds.values() {
            self.materialize(entry, &dir.join(&entry.name))?;
        }

        let added: Vec<&PatchTreeNode> =
            node.subdirs.values().filter(|s| self.state(s) == DirState::Added).collect();
        for sub in added {
            let path = dir.join(&sub.name);
            debug!("Mkdir {:?}", path);
            utils::create_dir(&path, STAGING_DIR_MODE).map_err(|e| StrataError::reconstruction(&path, e))?;
            self.summary.dirs_created += 1;
            self.apply_dir(sub, &path)?;
            self.set_attributes(&path, sub.owner, false)?;
            utils::set_mtime(&path, sub.mtime_nanos).map_err(|e| StrataError::reconstruction(&path, e))?;
        }

        for (name, change) in &node.meta_changes {
            let path = dir.join(name);
            let is_symlink = fs::symlink_metadata(&path)
                .map_err(|e| StrataError::reconstruction(&path, e))?
                .file_type()
                .is_symlink();
            let owner = change.target(self.forward);
            debug!("Meta {:?} -> {}", path, owner);
            self.set_attributes(&path, owner, is_symlink)?;
            self.summary.metadata_applied += 1;
        }

        for sub in node.subdirs.values().filter(|s| s.state == DirState::Existing) {
            self.apply_dir(sub, &dir.join(&sub.name))?;
        }
        Ok(())
    }

    fn materialize(&mut self, node: &Node, path: &Path) -> Result<()> {
        let fail = |e| StrataError::reconstruction(path, e);
        debug!("Create {} {:?}", node.node_type().label(), path);
        match &node.kind {
            NodeKind::RegularFile(file) => {
                let out = File::create(path).map_err(fail)?;
                let mut writer = BufWriter::new(out);
                let written = self.db.retrieve_content(file.content_id, &mut writer)?;
                writer.flush().map_err(fail)?;
                self.summary.bytes_written += written;
            }
            NodeKind::Symlink { target } => utils::create_symlink(target, path).map_err(fail)?,
            NodeKind::Socket => utils::create_socket(path).map_err(fail)?,
            NodeKind::Fifo => utils::create_fifo(path, node.owner.mode).map_err(fail)?,
            NodeKind::BlockDevice(dev) => {
                utils::create_device(path, DeviceKind::Block, node.owner.mode, *dev).map_err(fail)?
            }
            NodeKind::CharDevice(dev) => {
                utils::create_device(path, DeviceKind::Char, node.owner.mode, *dev).map_err(fail)?
            }
            NodeKind::Directory(_) => {
                return Err(StrataError::internal(format!(
                    "directory {:?} recorded as a plain entry",
                    path
                )))
            }
        }
        let is_symlink = matches!(node.kind, NodeKind::Symlink { .. });
        self.set_attributes(path, node.owner, is_symlink)?;
        utils::set_mtime(path, node.mtime_nanos).map_err(fail)?;
        self.summary.entries_created += 1;
        Ok(())
    }

    /// Restore ownership (best effort) and permission bits
    fn set_attributes(&mut self, path: &Path, owner: Ownership, is_symlink: bool) -> Result<()> {
        if let Err(e) = utils::set_ownership(path, owner.uid, owner.gid) {
            let message = format!("could not set owner {}:{} on {:?}: {}", owner.uid, owner.gid, path, e);
            warn!("{}", message);
            self.summary.warnings.push(message);
        }
        if !is_symlink {
            utils::set_permissions(path, owner.mode).map_err(|e| StrataError::reconstruction(path, e))?;
        }
        Ok(())
    }
}
