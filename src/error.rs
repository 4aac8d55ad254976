//! Error types for the Strata library
//!
//! This module defines all error types that can occur while scanning,
//! recording, exporting, importing and applying patches. Errors carry
//! enough context (path, operation) to be logged at the call site before
//! they propagate.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Strata library
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for all Strata operations
#[derive(Debug, Error)]
pub enum StrataError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Failure reported by the durable object store
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Patch chain linkage is broken or an import does not fit the chain head
    #[error("Chain integrity error: {0}")]
    ChainIntegrity(String),

    /// Attempt to export a patch that has not been completed yet
    #[error("Patch {0} is incomplete and cannot be exported")]
    IncompletePatch(u64),

    /// Patch not present in the chain
    #[error("Patch not found: {0}")]
    PatchNotFound(u64),

    /// Content id not present in the content index
    #[error("Content record not found: {0}")]
    ContentNotFound(u64),

    /// Append, seek or read failure on the content store
    #[error("Content store {operation} failed: {source}")]
    StoreIo {
        /// Operation that failed (append, retrieve, export, import)
        operation: &'static str,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Stored data does not match its index entry, or a patch file is malformed
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// A target entry could not be created or removed while applying a patch
    #[error("Reconstruction failed at {path:?}: {source}")]
    Reconstruction {
        /// Path being reconstructed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable failure while scanning the live filesystem
    #[error("Scan failed at {path:?}: {source}")]
    Scan {
        /// Path being examined
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No registered mount point covers the given path
    #[error("No filesystem id registered for {0:?}")]
    UnknownFilesystem(PathBuf),

    /// File type that cannot be represented as a node
    #[error("Unsupported file type: {0:?}")]
    UnsupportedFileType(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage already exists
    #[error("Storage already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for StrataError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StrataError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StrataError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StrataError::Bincode(err.to_string())
    }
}

impl From<sled::Error> for StrataError {
    fn from(err: sled::Error) -> Self {
        StrataError::ObjectStore(err.to_string())
    }
}

impl StrataError {
    /// Create a chain integrity error with a custom message
    pub fn chain(msg: impl Into<String>) -> Self {
        StrataError::ChainIntegrity(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corruption(msg: impl Into<String>) -> Self {
        StrataError::Corruption(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }

    /// Wrap an I/O error raised by the content store
    pub fn store_io(operation: &'static str, source: std::io::Error) -> Self {
        StrataError::StoreIo { operation, source }
    }

    /// Wrap an I/O error raised while reconstructing `path`
    pub fn reconstruction(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StrataError::Reconstruction {
            path: path.into(),
            source,
        }
    }

    /// Check if this error means the patch chain rejected an operation
    pub fn is_chain_error(&self) -> bool {
        matches!(self, StrataError::ChainIntegrity(_))
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, StrataError::Corruption(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            StrataError::ChainIntegrity(msg) => {
                format!("{}. Import patches in chain order, starting from the root patch.", msg)
            }
            StrataError::IncompletePatch(seq) => {
                format!("Patch {} is still open. Run a scan to complete it before exporting.", seq)
            }
            StrataError::Reconstruction { path, source } => {
                format!(
                    "Failed to reconstruct {:?}: {}. The target tree is now in an indeterminate state, re-apply from backup.",
                    path, source
                )
            }
            StrataError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'strata init' first.", path)
            }
            _ => self.to_string(),
        }
    }
}
