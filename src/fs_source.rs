//! Filesystem enumeration
//!
//! The scanner never touches the filesystem directly; it asks a
//! [`FileSystem`] for directory listings (already `lstat`ed), for readers
//! over regular-file content and for the mount table. [`LocalFileSystem`]
//! is the implementation over the host filesystem.

use crate::error::{Result, StrataError};
use crate::tree::{NodeType, Ownership};
use crate::types::FsEntry;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of directory listings and file content
pub trait FileSystem {
    /// `lstat` every entry of the directory at `path`
    ///
    /// A directory that cannot be listed yields [`StrataError::Io`]; an entry
    /// that cannot be examined yields [`StrataError::Scan`].
    fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>>;

    /// Open a regular file for reading
    fn open(&self, path: &Path) -> Result<Box<dyn Read>>;

    /// Mount points with a flag telling whether each one is local
    fn mount_table(&self) -> Result<Vec<(PathBuf, bool)>>;
}

/// Host filesystem
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    local_types: Vec<String>,
    mounts_file: PathBuf,
}

impl LocalFileSystem {
    /// Filesystem treating `local_types` as local in the mount table
    pub fn new(local_types: Vec<String>) -> Self {
        Self {
            local_types,
            mounts_file: PathBuf::from("/proc/mounts"),
        }
    }

    /// Read the mount table from another file (same format as `/proc/mounts`)
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    fn entry(&self, name: String, path: PathBuf, meta: &Metadata) -> Result<Option<FsEntry>> {
        let ft = meta.file_type();
        let node_type = match file_type(&ft) {
            Some(t) => t,
            None => return Err(StrataError::UnsupportedFileType(path)),
        };

        let symlink_target = if node_type == NodeType::Symlink {
            let target = fs::read_link(&path).map_err(|e| StrataError::Scan {
                path: path.clone(),
                source: e,
            })?;
            match target.into_os_string().into_string() {
                Ok(t) => Some(t),
                Err(_) => {
                    warn!("Skipping symlink with non UTF-8 target: {:?}", path);
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let stat = platform::stat(meta);
        Ok(Some(FsEntry {
            name,
            path,
            node_type,
            owner: Ownership::new(stat.uid, stat.gid, stat.mode),
            mtime_nanos: stat.mtime_nanos,
            inode: stat.inode,
            nlink: stat.nlink,
            size: meta.len(),
            device: match node_type {
                NodeType::BlockDevice | NodeType::CharDevice => Some(stat.device),
                _ => None,
            },
            symlink_target,
            filesystem_id: None,
        }))
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new(crate::types::default_local_filesystem_types())
    }
}

impl FileSystem for LocalFileSystem {
    fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        for item in fs::read_dir(path)? {
            let item = item?;
            let child = item.path();
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("Skipping entry with non UTF-8 name {:?} in {:?}", raw, path);
                    continue;
                }
            };
            let meta = match fs::symlink_metadata(&child) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Entry vanished during scan: {:?}", child);
                    continue;
                }
                Err(e) => return Err(StrataError::Scan { path: child, source: e }),
            };
            if let Some(entry) = self.entry(name, child, &meta)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read>> {
        Ok(Box::new(File::open(path)?))
    }

    fn mount_table(&self) -> Result<Vec<(PathBuf, bool)>> {
        let text = match fs::read_to_string(&self.mounts_file) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No mount table at {:?}", self.mounts_file);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse_mount_table(&text, &self.local_types))
    }
}

fn file_type(ft: &fs::FileType) -> Option<NodeType> {
    if ft.is_dir() {
        return Some(NodeType::Directory);
    }
    if ft.is_file() {
        return Some(NodeType::RegularFile);
    }
    if ft.is_symlink() {
        return Some(NodeType::Symlink);
    }
    platform::special_type(ft)
}

/// Parse `/proc/mounts` lines into (mount point, is local)
pub fn parse_mount_table(text: &str, local_types: &[String]) -> Vec<(PathBuf, bool)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some((
                PathBuf::from(unescape_mount_path(mount_point)),
                local_types.iter().any(|t| t == fs_type),
            ))
        })
        .collect()
}

/// Undo the octal escapes (`\040` etc.) used in the mount table
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct RawStat {
    uid: u32,
    gid: u32,
    mode: u32,
    mtime_nanos: i64,
    inode: u64,
    nlink: u64,
    device: crate::tree::DeviceNumber,
}

#[cfg(unix)]
mod platform {
    use super::RawStat;
    use crate::tree::{DeviceNumber, NodeType};
    use std::fs::{FileType, Metadata};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    pub(super) fn stat(meta: &Metadata) -> RawStat {
        let rdev = meta.rdev();
        RawStat {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            mtime_nanos: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            inode: meta.ino(),
            nlink: meta.nlink(),
            device: DeviceNumber {
                major: nix::sys::stat::major(rdev as _) as u64,
                minor: nix::sys::stat::minor(rdev as _) as u64,
            },
        }
    }

    pub(super) fn special_type(ft: &FileType) -> Option<NodeType> {
        if ft.is_socket() {
            Some(NodeType::Socket)
        } else if ft.is_fifo() {
            Some(NodeType::Fifo)
        } else if ft.is_block_device() {
            Some(NodeType::BlockDevice)
        } else if ft.is_char_device() {
            Some(NodeType::CharDevice)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::RawStat;
    use crate::tree::{DeviceNumber, NodeType};
    use std::fs::{FileType, Metadata};
    use std::time::UNIX_EPOCH;

    pub(super) fn stat(meta: &Metadata) -> RawStat {
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i64);
        RawStat {
            uid: 0,
            gid: 0,
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            mtime_nanos,
            inode: 0,
            nlink: 1,
            device: DeviceNumber { major: 0, minor: 0 },
        }
    }

    pub(super) fn special_type(_ft: &FileType) -> Option<NodeType> {
        None
    }
}
