//! Patch chain and the tree-shaped diff of one patch
//!
//! A patch records one diff round between two states of the tracked tree.
//! Patches are linked into a strict chain: patch *N* names patch *N-1* through
//! `previous_uuid` (the nil uuid for the first patch), so a chain can only be
//! extended at its head and an imported patch must name the local head.
//!
//! ## Structure
//!
//! ```text
//! PatchChain
//! ├── Patch 1  uuid=A  previous=0      content 1..=4
//! ├── Patch 2  uuid=B  previous=A      content 5..=4   (no new content)
//! └── Patch 3  uuid=C  previous=B      content 5..=9   (open)
//!     └── root: PatchTreeNode ""  EXISTING
//!         ├── adds      { "a.txt": File #5 }
//!         ├── removes   { "old":   Symlink }
//!         ├── meta      { "bin":   0:0 0755 <- 0:0 0700 }
//!         └── subdirs   { "etc": PatchTreeNode ADDED ... }
//! ```
//!
//! The tree of a patch only contains the directories touched during that
//! patch; untouched parts of the live tree have no counterpart.

use crate::error::{Result, StrataError};
use crate::tree::{fq_path, Node, Ownership};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, info};
use uuid::Uuid;

/// Whether a patched directory itself changed in the patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirState {
    /// Existed before and after the patch
    Existing,
    /// Created by the patch
    Added,
    /// Deleted by the patch
    Removed,
}

impl DirState {
    /// The state seen when the patch is applied in reverse
    pub fn reversed(self) -> Self {
        match self {
            DirState::Existing => DirState::Existing,
            DirState::Added => DirState::Removed,
            DirState::Removed => DirState::Added,
        }
    }

    /// Upper-case label used by dumps
    pub fn label(&self) -> &'static str {
        match self {
            DirState::Existing => "EXISTING",
            DirState::Added => "ADDED",
            DirState::Removed => "REMOVED",
        }
    }
}

/// Ownership change of one entry: the new triple and the one it replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaChange {
    /// State after the patch
    pub to: Ownership,
    /// State before the patch
    pub from: Ownership,
}

impl MetaChange {
    /// Triple to apply in the given direction
    pub fn target(&self, forward: bool) -> Ownership {
        if forward {
            self.to
        } else {
            self.from
        }
    }
}

/// Diff-shaped counterpart of a live directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTreeNode {
    /// Directory name (empty for the root)
    pub name: String,
    /// Directory ownership when the node was created
    pub owner: Ownership,
    /// Directory mtime when the node was created
    pub mtime_nanos: i64,
    /// Whether the directory itself was added or removed
    pub state: DirState,
    /// Entries introduced by the patch
    pub adds: BTreeMap<String, Node>,
    /// Entries removed by the patch, as they were before removal
    pub removes: BTreeMap<String, Node>,
    /// Ownership changes of entries in this directory
    pub meta_changes: BTreeMap<String, MetaChange>,
    /// Touched subdirectories
    pub subdirs: BTreeMap<String, PatchTreeNode>,
}

impl PatchTreeNode {
    /// Empty node with the given directory attributes
    pub fn new(name: impl Into<String>, owner: Ownership, mtime_nanos: i64, state: DirState) -> Self {
        Self {
            name: name.into(),
            owner,
            mtime_nanos,
            state,
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
            meta_changes: BTreeMap::new(),
            subdirs: BTreeMap::new(),
        }
    }

    /// Root node of a fresh patch
    pub fn root() -> Self {
        Self::new("", Ownership::new(0, 0, 0o755), 0, DirState::Existing)
    }

    /// Node built from a live directory node
    pub fn from_dir(dir: &Node, state: DirState) -> Self {
        Self::new(dir.name.clone(), dir.owner, dir.mtime_nanos, state)
    }

    /// Copy without subdirectories
    pub fn shallow_clone(&self) -> Self {
        Self {
            subdirs: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Whether the node records nothing at all
    pub fn is_empty(&self) -> bool {
        self.state == DirState::Existing
            && self.adds.is_empty()
            && self.removes.is_empty()
            && self.meta_changes.is_empty()
            && self.subdirs.is_empty()
    }

    /// Walk down `components`
    pub fn get(&self, components: &[String]) -> Option<&PatchTreeNode> {
        let mut node = self;
        for name in components {
            node = node.subdirs.get(name)?;
        }
        Some(node)
    }

    /// Walk down `components` for mutation
    pub fn get_mut(&mut self, components: &[String]) -> Option<&mut PatchTreeNode> {
        let mut node = self;
        for name in components {
            node = node.subdirs.get_mut(name)?;
        }
        Some(node)
    }

    /// Visit this node and all subdirectories pre-order with their component stack
    pub fn walk<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(&[String], &'a PatchTreeNode),
    {
        let mut stack = Vec::new();
        self.walk_inner(&mut stack, visit);
    }

    fn walk_inner<'a, F>(&'a self, stack: &mut Vec<String>, visit: &mut F)
    where
        F: FnMut(&[String], &'a PatchTreeNode),
    {
        visit(stack, self);
        for (name, sub) in &self.subdirs {
            stack.push(name.clone());
            sub.walk_inner(stack, visit);
            stack.pop();
        }
    }

    /// Number of patched directories including this one
    pub fn dir_count(&self) -> usize {
        1 + self.subdirs.values().map(PatchTreeNode::dir_count).sum::<usize>()
    }

    /// Human-readable listing of the whole diff tree
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.walk(&mut |stack, node| {
            let indent = "   ".repeat(stack.len());
            let path = match stack.split_last() {
                Some((last, parents)) => fq_path(parents, last),
                None => "/".to_string(),
            };
            let _ = writeln!(out, "{}Dir {} {} {}", indent, node.state.label(), node.owner, path);
            if !node.adds.is_empty() {
                let _ = writeln!(out, "{} ** Adds **", indent);
                for entry in node.adds.values() {
                    let _ = writeln!(out, "{}   {}", indent, entry.describe());
                }
            }
            if !node.removes.is_empty() {
                let _ = writeln!(out, "{} ** Removes **", indent);
                for entry in node.removes.values() {
                    let _ = writeln!(out, "{}   {}", indent, entry.describe());
                }
            }
            if !node.meta_changes.is_empty() {
                let _ = writeln!(out, "{} ** Meta Mods **", indent);
                for (name, change) in &node.meta_changes {
                    let _ = writeln!(out, "{}   {} {} -> {}", indent, name, change.from, change.to);
                }
            }
        });
        out
    }
}

/// One chain-linked diff round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Position in the chain, starting at 1
    pub sequence_number: u64,
    /// Random id generated when the patch was created
    pub uuid: Uuid,
    /// Uuid of the predecessor (nil for the first patch)
    pub previous_uuid: Uuid,
    /// First content id introduced by this patch
    pub starting_content_id: u64,
    /// Last content id introduced (below `starting_content_id` when none)
    pub ending_content_id: u64,
    /// Frozen once the scan round that produced it finished
    pub is_complete: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Diff tree; persisted separately, one directory per key
    #[serde(skip, default = "PatchTreeNode::root")]
    pub root: PatchTreeNode,
}

impl Patch {
    fn new(sequence_number: u64, previous_uuid: Uuid, starting_content_id: u64) -> Self {
        Self {
            sequence_number,
            uuid: Uuid::new_v4(),
            previous_uuid,
            starting_content_id,
            ending_content_id: starting_content_id.saturating_sub(1),
            is_complete: false,
            created_at: Utc::now(),
            root: PatchTreeNode::root(),
        }
    }

    /// Completed patch read from a patch file
    ///
    /// Its content records start at `starting_content_id`; the chain assigns
    /// the sequence number on append.
    pub fn imported(
        uuid: Uuid,
        previous_uuid: Uuid,
        starting_content_id: u64,
        content_count: u64,
        root: PatchTreeNode,
    ) -> Self {
        Self {
            sequence_number: 0,
            uuid,
            previous_uuid,
            starting_content_id,
            ending_content_id: (starting_content_id + content_count).saturating_sub(1),
            is_complete: true,
            created_at: Utc::now(),
            root,
        }
    }

    /// Whether the patch introduced any content record
    pub fn has_content(&self) -> bool {
        self.ending_content_id >= self.starting_content_id
    }

    /// Number of content records introduced
    pub fn content_count(&self) -> u64 {
        if self.has_content() {
            self.ending_content_id - self.starting_content_id + 1
        } else {
            0
        }
    }

    /// Copy without the diff tree
    pub fn header(&self) -> Patch {
        Patch {
            root: PatchTreeNode::root(),
            ..self.clone()
        }
    }
}

/// Ordered, uuid-linked sequence of patches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchChain {
    last_sequence_number: u64,
    patches: BTreeMap<u64, Patch>,
}

impl PatchChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from persisted patches
    pub fn from_patches(last_sequence_number: u64, patches: impl IntoIterator<Item = Patch>) -> Self {
        Self {
            last_sequence_number,
            patches: patches.into_iter().map(|p| (p.sequence_number, p)).collect(),
        }
    }

    /// Sequence number of the newest patch (0 for an empty chain)
    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }

    /// Number of patches
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether the chain holds no patch
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Newest patch
    pub fn head(&self) -> Option<&Patch> {
        self.patches.get(&self.last_sequence_number)
    }

    /// Uuid new patches must name as predecessor
    pub fn head_uuid(&self) -> Uuid {
        self.head().map_or(Uuid::nil(), |p| p.uuid)
    }

    /// The newest patch if it is still open
    pub fn open_patch(&self) -> Option<&Patch> {
        self.head().filter(|p| !p.is_complete)
    }

    /// Patch by sequence number
    pub fn get(&self, sequence_number: u64) -> Option<&Patch> {
        self.patches.get(&sequence_number)
    }

    /// Patch by sequence number for mutation
    pub fn get_mut(&mut self, sequence_number: u64) -> Option<&mut Patch> {
        self.patches.get_mut(&sequence_number)
    }

    /// All patches in chain order
    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.patches.values()
    }

    /// Return the open patch, or allocate the next one
    ///
    /// `next_content_id` becomes the starting content id of a new patch.
    pub fn create_or_continue(&mut self, next_content_id: u64) -> &mut Patch {
        let (sequence_number, previous_uuid) = match self.open_patch() {
            Some(open) => (open.sequence_number, open.previous_uuid),
            None => {
                let previous_uuid = self.head_uuid();
                self.last_sequence_number += 1;
                (self.last_sequence_number, previous_uuid)
            }
        };
        self.patches.entry(sequence_number).or_insert_with(|| {
            let patch = Patch::new(sequence_number, previous_uuid, next_content_id);
            debug!(
                "Allocated patch {} ({}) after {}",
                patch.sequence_number, patch.uuid, previous_uuid
            );
            patch
        })
    }

    /// Freeze the open patch `sequence_number`
    ///
    /// `next_content_id` is the content index's next id; everything below it
    /// and from the patch's starting id on belongs to the patch.
    pub fn complete(&mut self, sequence_number: u64, next_content_id: u64) -> Result<&Patch> {
        let patch = self
            .patches
            .get_mut(&sequence_number)
            .ok_or(StrataError::PatchNotFound(sequence_number))?;
        if patch.is_complete {
            return Err(StrataError::chain(format!("patch {} is already complete", sequence_number)));
        }
        patch.ending_content_id = next_content_id.saturating_sub(1);
        patch.is_complete = true;
        info!(
            "Patch {} completed ({} content records)",
            sequence_number,
            patch.content_count()
        );
        Ok(patch)
    }

    /// Check that a patch naming `previous_uuid` may be appended
    pub fn check_importable(&self, previous_uuid: Uuid) -> Result<()> {
        if self.open_patch().is_some() {
            return Err(StrataError::chain(format!(
                "patch {} is still open",
                self.last_sequence_number
            )));
        }
        match self.head() {
            None if !previous_uuid.is_nil() => Err(StrataError::chain(
                "chain is empty, a root patch must be imported first",
            )),
            Some(head) if head.uuid != previous_uuid => Err(StrataError::chain(format!(
                "patch prerequisite {} does not match chain head {}",
                previous_uuid, head.uuid
            ))),
            _ => Ok(()),
        }
    }

    /// Append a completed patch produced elsewhere
    ///
    /// The sequence number is reassigned to follow the local head.
    pub fn append_imported(&mut self, mut patch: Patch) -> Result<&Patch> {
        self.check_importable(patch.previous_uuid)?;
        if !patch.is_complete {
            return Err(StrataError::IncompletePatch(patch.sequence_number));
        }
        self.last_sequence_number += 1;
        patch.sequence_number = self.last_sequence_number;
        info!("Imported patch {} as {}", patch.uuid, patch.sequence_number);
        Ok(self.patches.entry(patch.sequence_number).or_insert(patch))
    }

    /// Check sequence contiguity, uuid linkage, completeness and content ranges
    pub fn verify(&self) -> Result<()> {
        let mut previous: Option<&Patch> = None;
        for (expected, (seq, patch)) in (1u64..).zip(&self.patches) {
            if *seq != expected || patch.sequence_number != expected {
                return Err(StrataError::chain(format!("patch {} found where {} was expected", seq, expected)));
            }
            let expected_previous = previous.map_or(Uuid::nil(), |p| p.uuid);
            if patch.previous_uuid != expected_previous {
                return Err(StrataError::chain(format!(
                    "patch {} names predecessor {}, expected {}",
                    seq, patch.previous_uuid, expected_previous
                )));
            }
            if let Some(prev) = previous {
                if !prev.is_complete {
                    return Err(StrataError::chain(format!("patch {} is followed but incomplete", prev.sequence_number)));
                }
                if patch.starting_content_id != prev.ending_content_id + 1 {
                    return Err(StrataError::chain(format!(
                        "patch {} starts at content {}, expected {}",
                        seq,
                        patch.starting_content_id,
                        prev.ending_content_id + 1
                    )));
                }
            }
            previous = Some(patch);
        }
        if self.last_sequence_number != self.patches.len() as u64 {
            return Err(StrataError::chain(format!(
                "last sequence number {} but {} patches",
                self.last_sequence_number,
                self.patches.len()
            )));
        }
        Ok(())
    }
}
