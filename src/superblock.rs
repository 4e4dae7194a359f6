//! On-disk superblock (block 0).
//!
//! The superblock describes the filesystem geometry and keeps summary
//! counters for free blocks and free inodes. The counters mirror the
//! allocator and inode table and must match their ground truth after every
//! committed operation; mount recomputes them after log replay.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::checksum::checksum;
use crate::error::FsError;
use crate::unix_now;

/// Filesystem signature stored in the first field of block 0.
pub const MAGIC: u32 = 0xDF5F_0001;

/// Serialized size of the superblock record. Block 0 is padded with zeroes
/// up to the block size.
pub const SUPERBLOCK_SIZE: usize = 128;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Smallest image the format operation accepts.
pub const MIN_TOTAL_BLOCKS: u32 = 10;

/// Filesystem metadata header stored at block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Filesystem signature ([`MAGIC`]).
    pub magic: u32,
    /// Format version, starting at 1.
    pub version: u32,
    /// Block size in bytes, a power of two.
    pub block_size: u32,
    /// Total number of blocks, including block 0.
    pub total_blocks: u32,
    /// Number of inode slots in the inode table.
    pub inode_count: u32,
    /// Free blocks remaining.
    pub free_blocks: u32,
    /// Free inode slots remaining.
    pub free_inodes: u32,
    /// Inode number of the root directory, always 1.
    pub root_inode: u32,
    /// Seconds since the epoch at the last mount.
    pub last_mount_time: u64,
    /// Seconds since the epoch at the last counter update.
    pub last_write_time: u64,
    /// Integrity checksum over the record with this field zeroed.
    pub checksum: u32,
}

impl Superblock {
    /// Builds the superblock for a freshly formatted image.
    ///
    /// Block 0 is charged immediately; inodes 0 (invalid) and 1 (root) are
    /// charged against `free_inodes`. The inode count is derived as one
    /// inode per four blocks and persisted verbatim from then on.
    pub fn initialize(total_blocks: u32, block_size: u32) -> Result<Self, FsError> {
        if total_blocks < MIN_TOTAL_BLOCKS {
            return Err(FsError::Configuration {
                param: "total_blocks".into(),
                reason: format!("{total_blocks} is below the minimum of {MIN_TOTAL_BLOCKS}"),
            });
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(FsError::Configuration {
                param: "block_size".into(),
                reason: format!("{block_size} is not a power of two in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"),
            });
        }

        let inode_count = total_blocks / 4;
        let now = unix_now();
        let mut sb = Superblock {
            magic: MAGIC,
            version: 1,
            block_size,
            total_blocks,
            inode_count,
            free_blocks: total_blocks - 1,
            free_inodes: inode_count - 2,
            root_inode: 1,
            last_mount_time: now,
            last_write_time: now,
            checksum: 0,
        };
        sb.update_checksum();
        debug!(
            "initialized superblock: {} blocks of {} bytes, {} inodes",
            total_blocks, block_size, inode_count
        );
        Ok(sb)
    }

    /// Validates every field range plus the checksum.
    pub fn validate(&self) -> Result<(), FsError> {
        if self.magic != MAGIC {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("bad magic 0x{:08X}", self.magic),
            });
        }
        if self.version == 0 {
            return Err(FsError::CorruptedFilesystem {
                reason: "version 0".into(),
            });
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
            || !self.block_size.is_power_of_two()
        {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("bad block size {}", self.block_size),
            });
        }
        if self.total_blocks < MIN_TOTAL_BLOCKS {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("bad total blocks {}", self.total_blocks),
            });
        }
        if self.inode_count == 0 || self.inode_count > self.total_blocks {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("bad inode count {}", self.inode_count),
            });
        }
        if self.free_blocks > self.total_blocks {
            return Err(FsError::CorruptedFilesystem {
                reason: format!(
                    "free blocks {} exceed total {}",
                    self.free_blocks, self.total_blocks
                ),
            });
        }
        if self.free_inodes > self.inode_count {
            return Err(FsError::CorruptedFilesystem {
                reason: format!(
                    "free inodes {} exceed total {}",
                    self.free_inodes, self.inode_count
                ),
            });
        }
        if self.root_inode == 0 || self.root_inode >= self.inode_count {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("bad root inode {}", self.root_inode),
            });
        }

        let mut copy = self.clone();
        copy.checksum = 0;
        let expected = checksum(&copy.to_bytes());
        if self.checksum != expected {
            return Err(FsError::CorruptedFilesystem {
                reason: format!(
                    "superblock checksum mismatch: stored 0x{:08X}, computed 0x{:08X}",
                    self.checksum, expected
                ),
            });
        }
        Ok(())
    }

    /// Recomputes the checksum over the record with the checksum zeroed.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }

    /// Serializes the record to its fixed 128-byte layout.
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        let mut cur = Cursor::new(&mut buf[..]);
        // Writes into a fixed-size array cannot fail.
        cur.write_u32::<LittleEndian>(self.magic).unwrap();
        cur.write_u32::<LittleEndian>(self.version).unwrap();
        cur.write_u32::<LittleEndian>(self.block_size).unwrap();
        cur.write_u32::<LittleEndian>(self.total_blocks).unwrap();
        cur.write_u32::<LittleEndian>(self.inode_count).unwrap();
        cur.write_u32::<LittleEndian>(self.free_blocks).unwrap();
        cur.write_u32::<LittleEndian>(self.free_inodes).unwrap();
        cur.write_u32::<LittleEndian>(self.root_inode).unwrap();
        cur.write_u64::<LittleEndian>(self.last_mount_time).unwrap();
        cur.write_u64::<LittleEndian>(self.last_write_time).unwrap();
        cur.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf
    }

    /// Parses the record from its fixed layout. The caller validates.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("superblock truncated to {} bytes", buf.len()),
            });
        }
        let mut cur = Cursor::new(buf);
        Ok(Superblock {
            magic: cur.read_u32::<LittleEndian>()?,
            version: cur.read_u32::<LittleEndian>()?,
            block_size: cur.read_u32::<LittleEndian>()?,
            total_blocks: cur.read_u32::<LittleEndian>()?,
            inode_count: cur.read_u32::<LittleEndian>()?,
            free_blocks: cur.read_u32::<LittleEndian>()?,
            free_inodes: cur.read_u32::<LittleEndian>()?,
            root_inode: cur.read_u32::<LittleEndian>()?,
            last_mount_time: cur.read_u64::<LittleEndian>()?,
            last_write_time: cur.read_u64::<LittleEndian>()?,
            checksum: cur.read_u32::<LittleEndian>()?,
        })
    }

    /// Charges one block against the free counter.
    pub fn allocate_block(&mut self) -> Result<(), FsError> {
        if self.free_blocks == 0 {
            warn!("superblock has no free blocks to charge");
            return Err(FsError::NoSpace { requested: 1, available: 0 });
        }
        self.free_blocks -= 1;
        self.touch();
        Ok(())
    }

    /// Returns one block to the free counter.
    pub fn deallocate_block(&mut self) -> Result<(), FsError> {
        if self.free_blocks >= self.total_blocks {
            warn!("superblock free block counter already at maximum");
            return Err(FsError::CorruptedFilesystem {
                reason: "free block counter overflow".into(),
            });
        }
        self.free_blocks += 1;
        self.touch();
        Ok(())
    }

    /// Charges one inode against the free counter.
    pub fn allocate_inode(&mut self) -> Result<(), FsError> {
        if self.free_inodes == 0 {
            warn!("superblock has no free inodes to charge");
            return Err(FsError::NoInodes);
        }
        self.free_inodes -= 1;
        self.touch();
        Ok(())
    }

    /// Returns one inode to the free counter.
    pub fn deallocate_inode(&mut self) -> Result<(), FsError> {
        if self.free_inodes >= self.inode_count {
            warn!("superblock free inode counter already at maximum");
            return Err(FsError::CorruptedFilesystem {
                reason: "free inode counter overflow".into(),
            });
        }
        self.free_inodes += 1;
        self.touch();
        Ok(())
    }

    /// Stamps the mount time, refreshing the checksum.
    pub fn update_mount_time(&mut self) {
        self.last_mount_time = unix_now();
        self.update_checksum();
    }

    /// True when at least `blocks_needed` blocks are free.
    pub fn is_space_available(&self, blocks_needed: u32) -> bool {
        self.free_blocks >= blocks_needed
    }

    /// True when at least `inodes_needed` inode slots are free.
    pub fn are_inodes_available(&self, inodes_needed: u32) -> bool {
        self.free_inodes >= inodes_needed
    }

    /// Percentage of blocks in use.
    pub fn block_usage_percent(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        f64::from(self.total_blocks - self.free_blocks) / f64::from(self.total_blocks) * 100.0
    }

    /// Percentage of inode slots in use.
    pub fn inode_usage_percent(&self) -> f64 {
        if self.inode_count == 0 {
            return 0.0;
        }
        f64::from(self.inode_count - self.free_inodes) / f64::from(self.inode_count) * 100.0
    }

    fn touch(&mut self) {
        self.last_write_time = unix_now();
        self.update_checksum();
    }
}
