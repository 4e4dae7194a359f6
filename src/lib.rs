//! # ledgerfs
//!
//! A single-host, block-structured filesystem stored inside a regular
//! host file, with write-ahead-logged transactions that make metadata
//! updates atomic across crashes.
//!
//! ## On-disk layout
//!
//! ```text
//! +--------------------+  offset 0
//! | Superblock         |  geometry, counters, checksums
//! +--------------------+  offset block_size
//! | Inode table        |  fixed 128-byte records
//! | Inode free bitmap  |  one bit per slot, 1 = free
//! | Block free bitmap  |  one bit per block, 1 = free
//! +--------------------+  next block boundary
//! | Data blocks        |  numbered from 1; block 0 is the superblock
//! +--------------------+
//! ```
//!
//! A separate append-only log file holds committed transaction records;
//! mount replays it before the namespace comes online.
//!
//! ## Example
//!
//! ```no_run
//! use ledgerfs::FileSystem;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), ledgerfs::FsError> {
//! let fs = FileSystem::new();
//! fs.format(Path::new("disk.img"), Path::new("disk.wal"), 1024, 4096)?;
//! fs.mount(Path::new("disk.img"), Path::new("disk.wal"))?;
//! fs.create_file("/hello.txt", 0o644)?;
//! fs.write_file("/hello.txt", b"hello, world")?;
//! assert_eq!(fs.read_file("/hello.txt")?, b"hello, world");
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod checksum;
pub mod device;
pub mod error;
pub mod fs;
pub mod inode;
pub mod superblock;
pub mod wal;

pub use crate::alloc::{BlockAllocator, BlockStats};
pub use crate::device::{DataBlock, Device, Geometry, DEFAULT_BLOCK_SIZE};
pub use crate::error::{ErrorClass, FsError};
pub use crate::fs::{FileSystem, FileSystemInfo, FileSystemStats, ROOT_INODE};
pub use crate::inode::{Inode, InodeStats, InodeTable};
pub use crate::superblock::Superblock;
pub use crate::wal::{LogOp, LogRecord, TransactionGuard, TransactionManager, TxStats};

/// Seconds since the Unix epoch, saturating at zero for clocks set
/// before it.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
