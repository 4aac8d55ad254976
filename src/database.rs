//! In-memory engine state with per-call durable commits
//!
//! [`Database`] owns the live tree, the content index and store, the mount
//! and inode registry and the patch chain. Mutations go through methods that
//! record which persistent keys they touched; [`Database::commit`] writes
//! exactly those keys to the [`ObjectStore`] as one atomic batch.
//!
//! ## Keys
//!
//! | Key | Value |
//! |---|---|
//! | `dir:<fq>` | directory node with shallow children |
//! | `content:<id>` | [`ContentRecord`] |
//! | `mounts` | [`MountTable`] |
//! | `inode:<fs>:<ino>` | [`InodeEntry`] |
//! | `chain` | last patch sequence number |
//! | `patch:<seq>` | [`Patch`] header |
//! | `pdir:<seq>:<fq>` | [`PatchTreeNode`] without subdirectories |
//!
//! Content bytes are synced to disk before any batch that references them is
//! committed, so a committed record never points at unwritten data.

use crate::chain::{DirState, Patch, PatchChain, PatchTreeNode};
use crate::content_store::{ContentIndex, ContentStore};
use crate::error::{Result, StrataError};
use crate::object_store::{decode, encode, ObjectStore, WriteBatch};
use crate::registry::{FilesystemRegistry, InodeEntry, MountTable};
use crate::tree::{dir_fq_path, fq_path, split_fq, Directory, Node, Ownership};
use crate::types::ContentRecord;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, trace};

/// Persistent key touched since the last commit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum DirtyKey {
    Dir(String),
    Content(u64),
    Mounts,
    Inode(u64, u64),
    Chain,
    Patch(u64),
    PatchDir(u64, String),
}

impl DirtyKey {
    fn key(&self) -> String {
        match self {
            DirtyKey::Dir(fq) => format!("dir:{}", fq),
            DirtyKey::Content(id) => format!("content:{:020}", id),
            DirtyKey::Mounts => "mounts".to_string(),
            DirtyKey::Inode(fs, ino) => format!("inode:{}:{}", fs, ino),
            DirtyKey::Chain => "chain".to_string(),
            DirtyKey::Patch(seq) => format!("patch:{:020}", seq),
            DirtyKey::PatchDir(seq, fq) => format!("pdir:{:020}:{}", seq, fq),
        }
    }
}

fn pdir_prefix(seq: u64) -> String {
    format!("pdir:{:020}:", seq)
}

/// Directory node carrying shallow copies of its children
fn shallow_listing(dir: &Node) -> Node {
    let mut listing = dir.shallow_clone();
    if let (Some(out), Some(src)) = (listing.as_directory_mut(), dir.as_directory()) {
        for child in src.children.values() {
            out.insert(child.shallow_clone());
        }
    }
    listing
}

/// Engine state plus the stores it persists to
pub struct Database {
    store: Box<dyn ObjectStore>,
    content: ContentStore,
    root: Node,
    index: ContentIndex,
    registry: FilesystemRegistry,
    chain: PatchChain,
    dirty: BTreeSet<DirtyKey>,
    content_written: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("content", &self.content)
            .field("records", &self.index.len())
            .field("patches", &self.chain.len())
            .finish()
    }
}

impl Database {
    /// Load all state from `store` and open the content store at `content_path`
    pub fn load(
        store: Box<dyn ObjectStore>,
        content_path: &Path,
        compression_level: u32,
        chunk_size: usize,
    ) -> Result<Self> {
        let root = load_live_tree(store.as_ref())?;

        let records = store
            .scan_prefix("content:")?
            .into_iter()
            .map(|(_, v)| decode::<ContentRecord>(&v))
            .collect::<Result<Vec<_>>>()?;
        let index = ContentIndex::from_records(records);
        index.verify_offsets()?;

        let table = match store.get("mounts")? {
            Some(bytes) => decode::<MountTable>(&bytes)?,
            None => MountTable::default(),
        };
        let mut inodes = Vec::new();
        for (key, value) in store.scan_prefix("inode:")? {
            let mut parts = key.splitn(3, ':').skip(1);
            let fs = parts.next().and_then(|s| s.parse::<u64>().ok());
            let ino = parts.next().and_then(|s| s.parse::<u64>().ok());
            match (fs, ino) {
                (Some(fs), Some(ino)) => inodes.push(((fs, ino), decode::<InodeEntry>(&value)?)),
                _ => return Err(StrataError::corruption(format!("malformed inode key {}", key))),
            }
        }
        let registry = FilesystemRegistry::from_parts(table, inodes);

        let chain = load_chain(store.as_ref())?;
        let content = ContentStore::open(content_path, &index, compression_level, chunk_size)?;

        info!(
            "Loaded database: {} entries, {} content records, {} patches",
            root.as_directory().map_or(0, Directory::count_recursive),
            index.len(),
            chain.len()
        );
        Ok(Self {
            store,
            content,
            root,
            index,
            registry,
            chain,
            dirty: BTreeSet::new(),
            content_written: false,
        })
    }

    /// Root of the live tree
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Content index
    pub fn index(&self) -> &ContentIndex {
        &self.index
    }

    /// Content store
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Mount and inode registry
    pub fn registry(&self) -> &FilesystemRegistry {
        &self.registry
    }

    /// Patch chain
    pub fn chain(&self) -> &PatchChain {
        &self.chain
    }

    /// Whether mutations are waiting for a commit
    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn live_dir_mut(&mut self, components: &[String]) -> Result<&mut Directory> {
        self.root
            .as_directory_mut()
            .and_then(|d| d.get_dir_mut(components))
            .ok_or_else(|| StrataError::internal(format!("live directory {:?} missing", dir_fq_path(components))))
    }

    /// Insert (or replace) an entry of the directory at `components`
    pub fn insert_entry(&mut self, components: &[String], node: Node) -> Result<Option<Node>> {
        let child_fq = fq_path(components, &node.name);
        let mut added_dirs = Vec::new();
        collect_dir_keys(&child_fq, &node, &mut added_dirs);
        let previous = self.live_dir_mut(components)?.insert(node);
        self.dirty.insert(DirtyKey::Dir(dir_fq_path(components)));
        self.dirty.extend(added_dirs.into_iter().map(DirtyKey::Dir));
        if let Some(old) = &previous {
            self.mark_dir_subtree(&child_fq, old);
        }
        Ok(previous)
    }

    /// Detach an entry of the directory at `components`
    pub fn remove_entry(&mut self, components: &[String], name: &str) -> Result<Option<Node>> {
        let removed = self.live_dir_mut(components)?.remove(name);
        self.dirty.insert(DirtyKey::Dir(dir_fq_path(components)));
        if let Some(node) = &removed {
            self.mark_dir_subtree(&fq_path(components, name), node);
        }
        Ok(removed)
    }

    /// Overwrite the ownership triple of an entry
    pub fn set_ownership(&mut self, components: &[String], name: &str, owner: Ownership) -> Result<()> {
        let node = self
            .live_dir_mut(components)?
            .get_mut(name)
            .ok_or_else(|| StrataError::internal(format!("entry {} missing", fq_path(components, name))))?;
        node.owner = owner;
        let is_dir = node.is_dir();
        self.dirty.insert(DirtyKey::Dir(dir_fq_path(components)));
        if is_dir {
            self.dirty.insert(DirtyKey::Dir(fq_path(components, name)));
        }
        Ok(())
    }

    fn mark_dir_subtree(&mut self, fq: &str, node: &Node) {
        let mut keys = Vec::new();
        collect_dir_keys(fq, node, &mut keys);
        self.dirty.extend(keys.into_iter().map(DirtyKey::Dir));
    }

    /// Compress `length` bytes from `reader` into a new content record
    pub fn store_content<R: Read>(&mut self, reader: R, length: u64) -> Result<ContentRecord> {
        let record = self.content.store(&mut self.index, reader, length)?;
        if record.compressed_length > 0 {
            self.content_written = true;
        }
        self.dirty.insert(DirtyKey::Content(record.content_id));
        Ok(record)
    }

    /// Decompress a content record into `sink`
    pub fn retrieve_content<W: Write>(&self, content_id: u64, sink: W) -> Result<u64> {
        self.content.retrieve(&self.index, content_id, sink)
    }

    /// Register a mount point
    pub fn register_mount(&mut self, path: &Path) -> u64 {
        let known = self.registry.mount_table().mounts.len();
        let id = self.registry.register_mount(path);
        if self.registry.mount_table().mounts.len() != known {
            self.dirty.insert(DirtyKey::Mounts);
        }
        id
    }

    /// Register every unknown local mount from a mount table
    pub fn check_filesystems(&mut self, mount_table: &[(std::path::PathBuf, bool)]) -> Vec<u64> {
        let added = self.registry.check_filesystems(mount_table);
        if !added.is_empty() {
            self.dirty.insert(DirtyKey::Mounts);
        }
        added
    }

    /// Link a tracked path to an inode
    pub fn link_inode(&mut self, filesystem_id: u64, inode: u64, content_id: u64, path: &str) -> Result<bool> {
        let created = self.registry.link(filesystem_id, inode, content_id, path)?;
        self.dirty.insert(DirtyKey::Inode(filesystem_id, inode));
        Ok(created)
    }

    /// Unlink a tracked path from an inode
    pub fn unlink_inode(&mut self, filesystem_id: u64, inode: u64, path: &str) -> bool {
        self.dirty.insert(DirtyKey::Inode(filesystem_id, inode));
        self.registry.unlink(filesystem_id, inode, path)
    }

    /// Return the open patch or allocate a new one, returning its sequence number
    pub fn create_or_continue_patch(&mut self) -> u64 {
        let next = self.index.next_content_id();
        let seq = self.chain.create_or_continue(next).sequence_number;
        self.dirty.insert(DirtyKey::Chain);
        self.dirty.insert(DirtyKey::Patch(seq));
        self.dirty.insert(DirtyKey::PatchDir(seq, String::new()));
        seq
    }

    /// Freeze patch `seq`
    pub fn complete_patch(&mut self, seq: u64) -> Result<()> {
        let next = self.index.next_content_id();
        self.chain.complete(seq, next)?;
        self.dirty.insert(DirtyKey::Patch(seq));
        Ok(())
    }

    /// Patched directory at `components` in patch `seq`
    ///
    /// Missing ancestors are created as `Existing` nodes carrying the
    /// attributes of the matching live directory.
    pub fn patch_dir_mut(&mut self, seq: u64, components: &[String]) -> Result<&mut PatchTreeNode> {
        let live_root = self.root.as_directory();
        let patch = self.chain.get_mut(seq).ok_or(StrataError::PatchNotFound(seq))?;
        for depth in 1..=components.len() {
            let prefix = &components[..depth];
            if patch.root.get(prefix).is_some() {
                continue;
            }
            let (parents, name) = prefix.split_at(depth - 1);
            let name = &name[0];
            let template = live_root
                .and_then(|d| d.get_dir(parents))
                .and_then(|d| d.get(name))
                .map(|node| PatchTreeNode::from_dir(node, DirState::Existing))
                .unwrap_or_else(|| {
                    PatchTreeNode::new(name.clone(), Ownership::default(), 0, DirState::Existing)
                });
            if let Some(parent) = patch.root.get_mut(parents) {
                parent.subdirs.insert(name.clone(), template);
            }
            self.dirty.insert(DirtyKey::PatchDir(seq, dir_fq_path(prefix)));
        }
        self.dirty.insert(DirtyKey::PatchDir(seq, dir_fq_path(components)));
        patch
            .root
            .get_mut(components)
            .ok_or_else(|| StrataError::internal(format!("patch directory {:?} missing", dir_fq_path(components))))
    }

    /// Insert a subdirectory node into patch `seq`, replacing any previous one
    pub fn insert_patch_subdir(&mut self, seq: u64, components: &[String], node: PatchTreeNode) -> Result<()> {
        let name = node.name.clone();
        let previous = self.patch_dir_mut(seq, components)?.subdirs.insert(name.clone(), node);
        let mut child = components.to_vec();
        child.push(name);
        self.dirty.insert(DirtyKey::PatchDir(seq, dir_fq_path(&child)));
        if let Some(old) = previous {
            old.walk(&mut |stack, _| {
                let mut full = child.clone();
                full.extend_from_slice(stack);
                self.dirty.insert(DirtyKey::PatchDir(seq, dir_fq_path(&full)));
            });
        }
        Ok(())
    }

    /// Append an imported patch and its content records
    ///
    /// `records` must already carry local ids and offsets, and their bytes must
    /// already be written to the content store.
    pub fn append_imported(&mut self, records: Vec<ContentRecord>, patch: Patch) -> Result<u64> {
        let mut index = self.index.clone();
        let mut chain = self.chain.clone();
        let has_bytes = records.iter().any(|r| r.compressed_length > 0);
        for record in &records {
            index.append_existing(*record)?;
        }
        let seq = chain.append_imported(patch)?.sequence_number;

        self.index = index;
        self.chain = chain;
        self.content_written |= has_bytes;
        for record in &records {
            self.dirty.insert(DirtyKey::Content(record.content_id));
        }
        self.dirty.insert(DirtyKey::Chain);
        self.dirty.insert(DirtyKey::Patch(seq));
        if let Some(patch) = self.chain.get(seq) {
            let dirty = &mut self.dirty;
            patch.root.walk(&mut |stack, _| {
                dirty.insert(DirtyKey::PatchDir(seq, dir_fq_path(stack)));
            });
        }
        Ok(seq)
    }

    /// Write every touched key as one atomic batch
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        if self.content_written {
            self.content.sync()?;
        }

        let mut batch = WriteBatch::new();
        for key in &self.dirty {
            let value = self.current_value(key)?;
            match value {
                Some(bytes) => batch.put(key.key(), bytes),
                None => batch.delete(key.key()),
            }
        }
        let count = batch.len();
        self.store.commit(batch)?;
        self.dirty.clear();
        self.content_written = false;
        trace!("Committed {} keys", count);
        Ok(())
    }

    fn current_value(&self, key: &DirtyKey) -> Result<Option<Vec<u8>>> {
        match key {
            DirtyKey::Dir(fq) => {
                let components = split_fq(fq);
                let node = match components.split_last() {
                    None => Some(&self.root),
                    Some((name, parents)) => self
                        .root
                        .as_directory()
                        .and_then(|d| d.get_dir(parents))
                        .and_then(|d| d.get(name))
                        .filter(|n| n.is_dir()),
                };
                node.map(|n| encode(&shallow_listing(n))).transpose()
            }
            DirtyKey::Content(id) => self.index.get(*id).map(encode).transpose(),
            DirtyKey::Mounts => encode(self.registry.mount_table()).map(Some),
            DirtyKey::Inode(fs, ino) => self.registry.entry(*fs, *ino).map(encode).transpose(),
            DirtyKey::Chain => encode(&self.chain.last_sequence_number()).map(Some),
            DirtyKey::Patch(seq) => self.chain.get(*seq).map(|p| encode(&p.header())).transpose(),
            DirtyKey::PatchDir(seq, fq) => self
                .chain
                .get(*seq)
                .and_then(|p| p.root.get(&split_fq(fq)))
                .map(|n| encode(&n.shallow_clone()))
                .transpose(),
        }
    }
}

fn load_live_tree(store: &dyn ObjectStore) -> Result<Node> {
    let mut listings = store
        .scan_prefix("dir:")?
        .into_iter()
        .map(|(key, value)| -> Result<(Vec<String>, Node)> {
            let fq = key["dir:".len()..].to_string();
            Ok((split_fq(&fq), decode::<Node>(&value)?))
        })
        .collect::<Result<Vec<_>>>()?;
    listings.sort_by_key(|(components, _)| components.len());

    let mut root = Node::root();
    for (components, listing) in listings {
        match components.split_last() {
            None => root = listing,
            Some((name, parents)) => {
                let parent = root
                    .as_directory_mut()
                    .and_then(|d| d.get_dir_mut(parents))
                    .ok_or_else(|| StrataError::corruption(format!("orphan directory {}", fq_path(parents, name))))?;
                parent.insert(listing);
            }
        }
    }
    debug!("Loaded live tree");
    Ok(root)
}

fn load_chain(store: &dyn ObjectStore) -> Result<PatchChain> {
    let last = match store.get("chain")? {
        Some(bytes) => decode::<u64>(&bytes)?,
        None => 0,
    };
    let mut patches = Vec::new();
    for (_, value) in store.scan_prefix("patch:")? {
        let mut patch = decode::<Patch>(&value)?;
        let mut dirs = store
            .scan_prefix(&pdir_prefix(patch.sequence_number))?
            .into_iter()
            .map(|(key, value)| -> Result<(Vec<String>, PatchTreeNode)> {
                let fq = key[pdir_prefix(patch.sequence_number).len()..].to_string();
                Ok((split_fq(&fq), decode::<PatchTreeNode>(&value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        dirs.sort_by_key(|(components, _)| components.len());
        for (components, node) in dirs {
            match components.split_last() {
                None => patch.root = node,
                Some((name, parents)) => {
                    let parent = patch.root.get_mut(parents).ok_or_else(|| {
                        StrataError::corruption(format!(
                            "orphan patch directory {} in patch {}",
                            fq_path(parents, name),
                            patch.sequence_number
                        ))
                    })?;
                    parent.subdirs.insert(name.clone(), node);
                }
            }
        }
        patches.push(patch);
    }
    Ok(PatchChain::from_patches(last, patches))
}

/// Fully-qualified paths of `node` and every directory below it
fn collect_dir_keys(fq: &str, node: &Node, keys: &mut Vec<String>) {
    if let Some(dir) = node.as_directory() {
        keys.push(fq.to_string());
        for child in dir.children.values() {
            collect_dir_keys(&format!("{}/{}", fq, child.name), child, keys);
        }
    }
}
