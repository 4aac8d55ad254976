//! Utility functions for Strata
//!
//! This module collects the filesystem primitives used when a patch is
//! materialized onto a target tree, plus a few formatting and file helpers.
//!
//! ## Reconstruction primitives
//!
//! Every node type of the tree model has a creation primitive here:
//!
//! - **Regular files** are written by the applier itself from the content store
//! - **Symlinks**: [`create_symlink`]
//! - **Sockets**: [`create_socket`] binds and immediately drops a listener
//! - **FIFOs**: [`create_fifo`]
//! - **Block/char devices**: [`create_device`]
//!
//! Attributes are restored with [`set_ownership`] (does not follow symlinks),
//! [`set_permissions`] and [`set_mtime`] (nanosecond precision, does not
//! follow symlinks).
//!
//! All primitives return [`std::io::Result`]; callers attach the path and
//! turn failures into reconstruction errors.
//!
//! ## Platform Support
//!
//! Unix platforms get the full set. Elsewhere the special file types and
//! ownership changes report [`std::io::ErrorKind::Unsupported`].

use crate::error::Result;
use crate::tree::DeviceNumber;
use filetime::FileTime;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// Kind of device node to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Block device
    Block,
    /// Character device
    Char,
}

/// Create a directory with the given permission bits
#[cfg(unix)]
pub fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(mode).create(path)
}

/// Create a directory (non-Unix; permission bits are not applied)
#[cfg(not(unix))]
pub fn create_dir(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir(path)
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Set permissions (non-Unix implementation)
///
/// Only the owner write bit is honoured, through the read-only flag.
#[cfg(not(unix))]
pub fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

/// Change owner and group without following symlinks
#[cfg(unix)]
pub fn set_ownership(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

/// Change owner and group (unsupported on this platform)
#[cfg(not(unix))]
pub fn set_ownership(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "ownership is not supported"))
}

/// Set access and modification time from a nanosecond timestamp
///
/// Symlinks get their own times set, not their target's.
pub fn set_mtime(path: &Path, mtime_nanos: i64) -> io::Result<()> {
    let secs = mtime_nanos.div_euclid(1_000_000_000);
    let nanos = mtime_nanos.rem_euclid(1_000_000_000) as u32;
    let time = FileTime::from_unix_time(secs, nanos);
    filetime::set_symlink_file_times(path, time, time)
}

/// Create a symlink pointing at `target`
#[cfg(unix)]
pub fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};
    let resolved = link.parent().map_or_else(|| Path::new(target).to_path_buf(), |p| p.join(target));
    if resolved.is_dir() {
        symlink_dir(target, link)
    } else {
        symlink_file(target, link)
    }
}

/// Create a symlink (unsupported on this platform)
#[cfg(not(any(unix, windows)))]
pub fn create_symlink(_target: &str, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

/// Create a named pipe
#[cfg(unix)]
pub fn create_fifo(path: &Path, mode: u32) -> io::Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode as _))?;
    Ok(())
}

/// Create a named pipe (unsupported on this platform)
#[cfg(not(unix))]
pub fn create_fifo(_path: &Path, _mode: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "fifos are not supported"))
}

/// Create a Unix domain socket node
///
/// The listener is dropped right away; only the filesystem entry remains.
#[cfg(unix)]
pub fn create_socket(path: &Path) -> io::Result<()> {
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    drop(listener);
    Ok(())
}

/// Create a socket node (unsupported on this platform)
#[cfg(not(unix))]
pub fn create_socket(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "sockets are not supported"))
}

/// Create a block or character device node
#[cfg(unix)]
pub fn create_device(path: &Path, kind: DeviceKind, mode: u32, device: DeviceNumber) -> io::Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};
    let flag = match kind {
        DeviceKind::Block => SFlag::S_IFBLK,
        DeviceKind::Char => SFlag::S_IFCHR,
    };
    mknod(
        path,
        flag,
        Mode::from_bits_truncate(mode as _),
        makedev(device.major, device.minor),
    )?;
    Ok(())
}

/// Create a device node (unsupported on this platform)
#[cfg(not(unix))]
pub fn create_device(_path: &Path, _kind: DeviceKind, _mode: u32, _device: DeviceNumber) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "device nodes are not supported"))
}

/// Format bytes in human-readable form
///
/// Uses 1024 as the conversion factor. Values below 1 KB are printed as whole
/// numbers, larger ones with two decimals.
///
/// # Example
///
/// ```rust,ignore
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to temp file then rename)
///
/// The temporary file lives in the target's directory so the final rename
/// never crosses filesystems. Either the old or the new content is visible,
/// never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}
