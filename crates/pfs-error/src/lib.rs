#![forbid(unsafe_code)]
//! Error types for peekfs.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.
//! Every operation is a pure read; corruption is classified, never skipped.

use pfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all peekfs operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("not an ext4 image: superblock magic is {actual:#06x}, expected 0xef53")]
    NotExt4 { actual: u16 },

    #[error("corrupt superblock: {detail}")]
    CorruptSuperblock { detail: String },

    #[error("corrupt group descriptor table: {detail}")]
    CorruptGroupTable { detail: String },

    #[error("corrupt inode {ino}: {detail}")]
    CorruptInode { ino: u32, detail: String },

    #[error("corrupt extent tree of inode {ino}: {detail}")]
    CorruptExtentTree { ino: u32, detail: String },

    #[error("corrupt directory inode {ino}: {detail}")]
    CorruptDirectory { ino: u32, detail: String },

    #[error("{path}: not found")]
    NotFound { path: String },

    #[error("{path}: not a directory")]
    NotADirectory { path: String },

    #[error("{path}: not a regular file")]
    NotARegularFile { path: String },

    #[error("{path}: symbolic links are not supported")]
    SymlinkUnsupported { path: String },

    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PfsError {
    /// Wrap an I/O failure with the operation it happened under.
    #[must_use]
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Classify a record-level parse failure as superblock corruption.
    #[must_use]
    pub fn superblock(err: &ParseError) -> Self {
        Self::CorruptSuperblock {
            detail: err.to_string(),
        }
    }

    /// Classify a record-level parse failure as group-table corruption.
    #[must_use]
    pub fn group_table(err: &ParseError) -> Self {
        Self::CorruptGroupTable {
            detail: err.to_string(),
        }
    }

    /// Classify a record-level parse failure as inode corruption.
    #[must_use]
    pub fn inode(ino: pfs_types::InodeNumber, err: &ParseError) -> Self {
        Self::CorruptInode {
            ino: ino.0,
            detail: err.to_string(),
        }
    }

    /// Classify a record-level parse failure as extent-tree corruption.
    #[must_use]
    pub fn extent_tree(ino: pfs_types::InodeNumber, err: &ParseError) -> Self {
        Self::CorruptExtentTree {
            ino: ino.0,
            detail: err.to_string(),
        }
    }

    /// Classify a record-level parse failure as directory corruption.
    #[must_use]
    pub fn directory(ino: pfs_types::InodeNumber, err: &ParseError) -> Self {
        Self::CorruptDirectory {
            ino: ino.0,
            detail: err.to_string(),
        }
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;
