//! # Strata - Incremental filesystem snapshots as a patch chain
//!
//! Strata keeps a database mirror (the *live tree*) of a directory tree and,
//! on every scan, records what changed since the previous scan as a
//! self-contained *patch*. Patches form a linear chain linked by UUIDs. Each
//! patch can be exported to a portable file, imported into another database
//! that holds the same history, and materialized forward or in reverse onto
//! a target directory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::Strata;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut strata = Strata::init(
//!     PathBuf::from("./my_project"),     // Directory to track
//!     PathBuf::from("./.strata_storage") // Database and content store
//! )?;
//!
//! // The first scan records the whole tree as patch 1
//! let summary = strata.scan()?;
//! println!("Recorded patch {:?}", summary.completed_patch);
//!
//! // Make some changes, scan again, and ship the difference
//! if let Some(seq) = strata.scan()?.completed_patch {
//!     strata.export_patch(seq, &PathBuf::from("changes.patch"))?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Content store**: an append-only file of zlib-compressed content
//!   records, addressed by a dense integer id. Record *n* starts where
//!   record *n-1* ends, so any id range maps to one contiguous byte range.
//! - **Live tree**: the last observed state of every tracked node, kept in a
//!   [`sled`] database through the [`object_store::ObjectStore`] seam.
//! - **Filesystem registry**: mount points get filesystem ids; regular files
//!   are keyed by (filesystem id, inode) so hardlinks share one record.
//! - **Scanner**: walks the filesystem against the live tree and emits
//!   change events to a [`delta::Delta`] consumer.
//! - **Patch chain**: every scan that observes a change completes one patch
//!   describing the change per directory.
//!
//! ## Module Organization
//!
//! - [`strata`]: the [`Strata`] facade and [`StrataBuilder`]
//! - [`scanner`], [`filter`], [`fs_source`]: filesystem traversal
//! - [`delta`], [`updater`], [`recorder`]: change consumers
//! - [`database`], [`object_store`], [`content_store`], [`registry`], [`chain`]: state
//! - [`patch_file`], [`applier`]: moving patches between trees
//! - [`tree`], [`types`], [`compression`], [`error`]: shared types

pub mod applier;
pub mod chain;
pub mod compression;
pub mod content_store;
pub mod database;
pub mod delta;
pub mod error;
pub mod filter;
pub mod fs_source;
pub mod object_store;
pub mod patch_file;
pub mod recorder;
pub mod registry;
pub mod scanner;
pub mod strata;
pub mod tree;
pub mod types;
pub mod updater;
pub mod utils;

// Re-export main types for convenience
pub use chain::{DirState, MetaChange, Patch, PatchChain, PatchTreeNode};
pub use database::Database;
pub use error::{Result, StrataError};
pub use patch_file::{PatchFileHeader, PatchFileInfo};
pub use strata::{Strata, StrataBuilder, VerifyReport};
pub use tree::{Node, NodeKind, NodeType, Ownership};
pub use types::*;
