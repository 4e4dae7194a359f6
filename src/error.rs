//! Filesystem error taxonomy.
//!
//! Every fallible operation in the crate returns [`FsError`]. Each variant
//! carries the context a caller needs to act on the failure (inode number,
//! path, requested/available counts). Retry decisions belong to callers:
//! [`FsError::class`] maps a variant to an [`ErrorClass`] and
//! [`FsError::is_retriable`] answers the common question directly.

use thiserror::Error;

/// Errors surfaced by the filesystem engine.
#[derive(Error, Debug)]
pub enum FsError {
    /// No inode is allocated at the given number.
    #[error("inode {inode} not found")]
    InodeNotFound { inode: u32 },

    /// Block number is outside the device geometry.
    #[error("block {block} not found")]
    BlockNotFound { block: u32 },

    /// Path does not resolve to a regular file.
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Path does not resolve to a directory.
    #[error("directory not found: {path}")]
    DirectoryNotFound { path: String },

    /// Leaf name already exists in the parent directory.
    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    /// Directory still has entries.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    /// Caller is not allowed to perform the operation.
    #[error("permission denied: {op} on {path}")]
    PermissionDenied { path: String, op: String },

    /// Not enough free blocks to satisfy an allocation.
    #[error("no space: requested {requested} blocks, {available} available")]
    NoSpace { requested: u32, available: u32 },

    /// The inode table has no free slot.
    #[error("no free inodes")]
    NoInodes,

    /// Inode record failed validation.
    #[error("corrupted inode {inode}")]
    CorruptedInode { inode: u32 },

    /// Block content failed validation.
    #[error("corrupted block {block}")]
    CorruptedBlock { block: u32 },

    /// A structural or checksum failure anywhere in the image.
    #[error("corrupted filesystem: {reason}")]
    CorruptedFilesystem { reason: String },

    /// Operation requires a mounted filesystem.
    #[error("filesystem is not mounted")]
    NotMounted,

    /// Transaction id is unknown to the manager.
    #[error("transaction {tx} not found")]
    TransactionNotFound { tx: u64 },

    /// Transaction was aborted and can no longer be used.
    #[error("transaction {tx} aborted: {reason}")]
    TransactionAborted { tx: u64, reason: String },

    /// Transaction exceeded its wall-clock budget.
    #[error("transaction {tx} timed out after {secs}s")]
    TransactionTimeout { tx: u64, secs: u64 },

    /// An attempt had to be abandoned to avoid deadlock.
    #[error("concurrent access on inode {inode} during {op}")]
    ConcurrentAccess { inode: u32, op: String },

    /// Path is not absolute, not UTF-8 clean, or otherwise malformed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Read or write exceeds a fixed bound.
    #[error("out of bounds: offset {offset} + len {len} exceeds {bound}")]
    OutOfBounds { offset: u64, len: u64, bound: u64 },

    /// Invalid configuration parameter.
    #[error("bad configuration {param}: {reason}")]
    Configuration { param: String, reason: String },

    /// Failure reported by an external endpoint.
    #[error("network failure talking to {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },

    /// Caller exceeded its request budget.
    #[error("rate limited: {client}")]
    RateLimited { client: String },

    /// Host I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure classes used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry may succeed without any intervention.
    Transient,
    /// Lost a race with another caller.
    Concurrency,
    /// Operation or transaction ran out of time.
    Timeout,
    /// Remote endpoint misbehaved.
    Network,
    /// Retrying cannot help.
    Permanent,
    /// Data integrity is in question.
    Corruption,
}

impl FsError {
    /// Classifies the error for retry logic.
    pub fn class(&self) -> ErrorClass {
        match self {
            FsError::NoSpace { .. } | FsError::NoInodes | FsError::RateLimited { .. } => {
                ErrorClass::Transient
            }
            FsError::ConcurrentAccess { .. } => ErrorClass::Concurrency,
            FsError::TransactionTimeout { .. } => ErrorClass::Timeout,
            FsError::Network { .. } => ErrorClass::Network,
            FsError::CorruptedInode { .. }
            | FsError::CorruptedBlock { .. }
            | FsError::CorruptedFilesystem { .. } => ErrorClass::Corruption,
            FsError::Io(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// True when a caller may reasonably retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Concurrency | ErrorClass::Timeout | ErrorClass::Network
        )
    }

    /// True for any of the corruption variants.
    pub fn is_corruption(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_space_is_retriable() {
        let err = FsError::NoSpace { requested: 4, available: 0 };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_corruption_is_not_retriable() {
        let err = FsError::CorruptedInode { inode: 7 };
        assert_eq!(err.class(), ErrorClass::Corruption);
        assert!(!err.is_retriable());
        assert!(err.is_corruption());
    }

    #[test]
    fn test_not_found_is_permanent() {
        let err = FsError::FileNotFound { path: "/a".into() };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = FsError::TransactionTimeout { tx: 9, secs: 30 };
        assert_eq!(err.to_string(), "transaction 9 timed out after 30s");
    }
}
