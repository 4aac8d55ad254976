//! Live tree model
//!
//! The live tree is the materialized state of the tracked directory as of the
//! last scan. Every entry is a [`Node`]: a handful of attributes common to all
//! file types plus a closed [`NodeKind`] carrying the per-type data.
//!
//! Nodes hold no parent pointers. Anything that needs a fully-qualified path
//! threads the ancestor names explicitly (the scanner, the delta consumers and
//! the applier all keep a directory stack). Fully-qualified paths are relative
//! to the tracked root and use `/` separators with a leading slash, e.g.
//! `/etc/hosts`; the root itself is the empty string.
//!
//! ## Examples
//!
//! ```rust
//! use strata::tree::{fq_path, split_fq, Node, Ownership};
//!
//! let mut root = Node::root();
//! let etc = Node::directory("etc", Ownership::new(0, 0, 0o755), 0);
//! root.as_directory_mut().unwrap().insert(etc);
//!
//! assert!(root.as_directory().unwrap().get_dir(&split_fq("/etc")).is_some());
//! assert_eq!(fq_path(&["etc".to_string()], "hosts"), "/etc/hosts");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Permission bits kept on a node (file-type bits are always stripped)
pub const PERMISSION_MASK: u32 = 0o7777;

/// The seven kinds of filesystem entry the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    /// Directory
    Directory,
    /// Regular file
    RegularFile,
    /// Symbolic link
    Symlink,
    /// Unix domain socket
    Socket,
    /// Named pipe
    Fifo,
    /// Block device node
    BlockDevice,
    /// Character device node
    CharDevice,
}

impl NodeType {
    /// Short human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            NodeType::Directory => "Directory",
            NodeType::RegularFile => "File",
            NodeType::Symlink => "Symlink",
            NodeType::Socket => "Socket",
            NodeType::Fifo => "Fifo",
            NodeType::BlockDevice => "BlockDev",
            NodeType::CharDevice => "CharDev",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ownership and permission triple compared by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Ownership {
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Permission bits, never file-type bits
    pub mode: u32,
}

impl Ownership {
    /// Build an ownership triple, masking off any file-type bits in `mode`
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            uid,
            gid,
            mode: mode & PERMISSION_MASK,
        }
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {:04o}", self.uid, self.gid, self.mode)
    }
}

/// Major/minor pair of a device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNumber {
    /// Major number
    pub major: u64,
    /// Minor number
    pub minor: u64,
}

/// Regular-file specific attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularFile {
    /// Inode number on the source filesystem
    pub inode: u64,
    /// Size in bytes at scan time
    pub size: u64,
    /// Engine-assigned id of the filesystem the file lives on
    pub filesystem_id: u64,
    /// Content store record holding the file bytes
    pub content_id: u64,
}

/// Children of a directory keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Entries in this directory, names are unique
    pub children: BTreeMap<String, Node>,
}

/// Per-type payload of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Directory with its children
    Directory(Directory),
    /// Regular file backed by a content record
    RegularFile(RegularFile),
    /// Symbolic link
    Symlink {
        /// Link target as stored in the link
        target: String,
    },
    /// Unix domain socket
    Socket,
    /// Named pipe
    Fifo,
    /// Block device node
    BlockDevice(DeviceNumber),
    /// Character device node
    CharDevice(DeviceNumber),
}

/// One entry of the live tree (or of a patch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Entry name within its directory (empty for the root)
    pub name: String,
    /// Owner and permission bits
    pub owner: Ownership,
    /// Modification time in nanoseconds since the epoch
    pub mtime_nanos: i64,
    /// Type-specific data
    pub kind: NodeKind,
}

impl Node {
    /// The root of an empty live tree
    pub fn root() -> Self {
        Self::directory("", Ownership::new(0, 0, 0o755), 0)
    }

    /// Create an empty directory node
    pub fn directory(name: impl Into<String>, owner: Ownership, mtime_nanos: i64) -> Self {
        Self {
            name: name.into(),
            owner,
            mtime_nanos,
            kind: NodeKind::Directory(Directory::default()),
        }
    }

    /// File type carried by the variant tag
    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::RegularFile(_) => NodeType::RegularFile,
            NodeKind::Symlink { .. } => NodeType::Symlink,
            NodeKind::Socket => NodeType::Socket,
            NodeKind::Fifo => NodeType::Fifo,
            NodeKind::BlockDevice(_) => NodeType::BlockDevice,
            NodeKind::CharDevice(_) => NodeType::CharDevice,
        }
    }

    /// Whether this node is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// Directory payload, if this node is a directory
    pub fn as_directory(&self) -> Option<&Directory> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    /// Mutable directory payload, if this node is a directory
    pub fn as_directory_mut(&mut self) -> Option<&mut Directory> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    /// Regular-file payload, if this node is a regular file
    pub fn as_regular_file(&self) -> Option<&RegularFile> {
        match &self.kind {
            NodeKind::RegularFile(file) => Some(file),
            _ => None,
        }
    }

    /// Copy of this node with directory children dropped
    ///
    /// Used wherever a node is reported or persisted on its own: the scanner
    /// hands shallow copies to delta consumers and the database persists
    /// subdirectories as stubs.
    pub fn shallow_clone(&self) -> Node {
        match &self.kind {
            NodeKind::Directory(_) => Node::directory(self.name.clone(), self.owner, self.mtime_nanos),
            _ => self.clone(),
        }
    }

    /// One-line description used by debug dumps
    pub fn describe(&self) -> String {
        match &self.kind {
            NodeKind::RegularFile(f) => format!(
                "File     {} {:>10} #{} {}",
                self.owner, f.size, f.content_id, self.name
            ),
            NodeKind::Symlink { target } => format!("Symlink  {} {} -> {}", self.owner, self.name, target),
            NodeKind::BlockDevice(d) | NodeKind::CharDevice(d) => format!(
                "{:<8} {} {}:{} {}",
                self.node_type().label(),
                self.owner,
                d.major,
                d.minor,
                self.name
            ),
            _ => format!("{:<8} {} {}", self.node_type().label(), self.owner, self.name),
        }
    }
}

impl Directory {
    /// Insert or replace a child, returning the previous entry of that name
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.children.insert(node.name.clone(), node)
    }

    /// Detach a child by name
    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    /// Look up a child by name
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Look up a child by name for mutation
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.get_mut(name)
    }

    /// The set of `(name, type)` pairs present in this directory
    pub fn content_set(&self) -> BTreeSet<(String, NodeType)> {
        self.children
            .values()
            .map(|node| (node.name.clone(), node.node_type()))
            .collect()
    }

    /// Walk down `components` and return the directory found there
    pub fn get_dir(&self, components: &[String]) -> Option<&Directory> {
        let mut dir = self;
        for name in components {
            dir = dir.children.get(name)?.as_directory()?;
        }
        Some(dir)
    }

    /// Walk down `components` and return the directory found there for mutation
    pub fn get_dir_mut(&mut self, components: &[String]) -> Option<&mut Directory> {
        let mut dir = self;
        for name in components {
            dir = dir.children.get_mut(name)?.as_directory_mut()?;
        }
        Some(dir)
    }

    /// Number of entries in this directory and all of its descendants
    pub fn count_recursive(&self) -> usize {
        self.children
            .values()
            .map(|node| 1 + node.as_directory().map_or(0, Directory::count_recursive))
            .sum()
    }
}

/// Fully-qualified path of a directory given its component stack
pub fn dir_fq_path(components: &[String]) -> String {
    let mut path = String::new();
    for name in components {
        path.push('/');
        path.push_str(name);
    }
    path
}

/// Fully-qualified path of entry `name` inside the directory at `components`
pub fn fq_path(components: &[String], name: &str) -> String {
    let mut path = dir_fq_path(components);
    path.push('/');
    path.push_str(name);
    path
}

/// Split a fully-qualified path into its components (`""` yields none)
pub fn split_fq(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
