//! Delta consumer interface
//!
//! The scanner reports every difference it finds between the live tree and
//! the filesystem as a call on a [`Delta`]. All calls between a `push_dir` and
//! its matching `pop_dir` refer to entries of that directory.
//!
//! Emission order within one directory:
//!
//! 1. `content_removed` for non-directories
//! 2. directory removals, bottom-up (`push_dir`, children, `pop_dir`, then
//!    `directory_removed` in the parent)
//! 3. `content_added` for non-directories
//! 4. directory additions, top-down (`directory_added` in the parent, then
//!    `push_dir` and the children)
//! 5. `metadata_changed`
//! 6. recursion into unchanged subdirectories

use crate::error::Result;
use crate::tree::Node;
use crate::types::FsEntry;

/// Sink of scan-produced change events
pub trait Delta {
    /// Live tree the scanner compares against
    fn live_root(&self) -> &Node;

    /// Enter directory `name` (the empty string for the root)
    fn push_dir(&mut self, name: &str) -> Result<()>;

    /// Leave the current directory
    fn pop_dir(&mut self) -> Result<()>;

    /// A non-directory entry appeared
    ///
    /// With `force_placeholder` a regular file is stored as a zero-length
    /// record whatever its size.
    fn content_added(&mut self, entry: &FsEntry, force_placeholder: bool) -> Result<()>;

    /// A non-directory entry disappeared; `node` is its live-tree state
    fn content_removed(&mut self, node: &Node) -> Result<()>;

    /// Ownership or mode of an entry changed
    fn metadata_changed(&mut self, node: &Node, entry: &FsEntry) -> Result<()>;

    /// A directory disappeared (its children were already reported)
    fn directory_removed(&mut self, node: &Node) -> Result<()>;

    /// A directory appeared (its children follow)
    fn directory_added(&mut self, entry: &FsEntry) -> Result<()>;
}
