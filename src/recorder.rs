//! Patch Recorder: mirrors every delta into the open patch
//!
//! The recorder forwards each event to a [`LiveUpdater`] and records the same
//! change in the diff tree of the chain's open patch, creating patched
//! directories along the current path on demand. Both mutations land in one
//! commit.
//!
//! The patch itself is only allocated on the first recorded change; a scan
//! that finds nothing leaves the chain untouched. When the root directory is
//! popped after at least one change, the patch is completed.

use crate::chain::{DirState, MetaChange, PatchTreeNode};
use crate::delta::Delta;
use crate::error::Result;
use crate::tree::Node;
use crate::types::{FsEntry, ScanSummary};
use crate::updater::LiveUpdater;
use tracing::info;

/// Delta consumer recording changes into a patch
pub struct PatchRecorder<'a> {
    updater: LiveUpdater<'a>,
    sequence_number: Option<u64>,
    changed: bool,
}

impl<'a> PatchRecorder<'a> {
    /// Recorder forwarding to `updater`
    pub fn new(updater: LiveUpdater<'a>) -> Self {
        Self {
            updater,
            sequence_number: None,
            changed: false,
        }
    }

    /// Sequence number of the patch being recorded, once allocated
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }

    /// Consume the recorder, returning the scan counters
    pub fn into_summary(self) -> ScanSummary {
        self.updater.into_summary()
    }

    fn ensure_patch(&mut self) -> u64 {
        self.changed = true;
        match self.sequence_number {
            Some(seq) => seq,
            None => {
                let seq = self.updater.database().create_or_continue_patch();
                self.sequence_number = Some(seq);
                seq
            }
        }
    }

    /// Patched directory for the updater's current directory
    fn this_dir(&mut self, seq: u64) -> Result<&mut PatchTreeNode> {
        let components = self.updater.components().to_vec();
        self.updater.database().patch_dir_mut(seq, &components)
    }
}

impl Delta for PatchRecorder<'_> {
    fn live_root(&self) -> &Node {
        self.updater.live_root()
    }

    fn push_dir(&mut self, name: &str) -> Result<()> {
        self.updater.enter(name)
    }

    fn pop_dir(&mut self) -> Result<()> {
        self.updater.leave()?;
        if self.updater.depth() > 0 {
            return Ok(());
        }
        match self.sequence_number {
            Some(seq) if self.changed => {
                self.updater.database().complete_patch(seq)?;
                self.updater.commit()?;
                self.updater.summary_mut().completed_patch = Some(seq);
                info!("PATCH Completed: {}", seq);
            }
            _ => info!("PATCH: No changes detected"),
        }
        Ok(())
    }

    fn content_added(&mut self, entry: &FsEntry, force_placeholder: bool) -> Result<()> {
        let seq = self.ensure_patch();
        let node = self.updater.add_content(entry, force_placeholder)?;
        self.this_dir(seq)?.adds.insert(node.name.clone(), node);
        self.updater.commit()
    }

    fn content_removed(&mut self, node: &Node) -> Result<()> {
        let seq = self.ensure_patch();
        self.this_dir(seq)?.removes.insert(node.name.clone(), node.clone());
        self.updater.remove_content(node)?;
        self.updater.commit()
    }

    fn metadata_changed(&mut self, node: &Node, entry: &FsEntry) -> Result<()> {
        let seq = self.ensure_patch();
        self.this_dir(seq)?.meta_changes.insert(
            node.name.clone(),
            MetaChange {
                to: entry.owner,
                from: node.owner,
            },
        );
        self.updater.change_metadata(node, entry)?;
        self.updater.commit()
    }

    fn directory_removed(&mut self, node: &Node) -> Result<()> {
        let seq = self.ensure_patch();
        // Creates the patched directory from the live one if the removal of
        // its children did not already do so
        let mut components = self.updater.components().to_vec();
        components.push(node.name.clone());
        self.updater.database().patch_dir_mut(seq, &components)?.state = DirState::Removed;
        self.updater.remove_directory(node)?;
        self.updater.commit()
    }

    fn directory_added(&mut self, entry: &FsEntry) -> Result<()> {
        let seq = self.ensure_patch();
        let node = self.updater.add_directory(entry)?;
        let components = self.updater.components().to_vec();
        self.updater
            .database()
            .insert_patch_subdir(seq, &components, PatchTreeNode::from_dir(&node, DirState::Added))?;
        self.updater.commit()
    }
}
